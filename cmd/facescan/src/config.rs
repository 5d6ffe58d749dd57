//! Config file loading and library opening.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use facegroup_cluster::{Engine, EngineConfig};
use facegroup_faceprint::GeneratorConfig;
use facegroup_kv::RedbStore;
use facegroup_scan::ScanConfig;

pub const APP_NAME: &str = "facescan";
pub const DEFAULT_BASE_DIR: &str = ".facegroup";
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const STORE_FILE: &str = "library.redb";
pub const INDEX_FILE: &str = "anchors.idx";

/// Contents of `config.yaml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the store and anchor index live.
    pub data_dir: Option<PathBuf>,
    /// File extensions to scan; the catalog default when empty.
    pub extensions: Vec<String>,
    pub engine: EngineConfig,
    pub generator: GeneratorConfig,
    pub scan: ScanConfig,
}

impl AppConfig {
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_BASE_DIR).join(APP_NAME))
    }

    /// Load from `custom` or the default path. A missing default file is
    /// not an error.
    pub fn load(custom: Option<&str>) -> anyhow::Result<Self> {
        let path = match custom {
            Some(p) => PathBuf::from(p),
            None => match Self::default_dir() {
                Some(dir) => dir.join(DEFAULT_CONFIG_FILE),
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            if custom.is_some() {
                anyhow::bail!("config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parse {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_str(content)?;
        Ok(cfg)
    }

    /// The data directory: flag, then config, then the default.
    pub fn resolve_data_dir(&self, flag: Option<&str>) -> anyhow::Result<PathBuf> {
        if let Some(dir) = flag {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        Self::default_dir().ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))
    }
}

/// Open the clustering engine stored under `data_dir`.
pub fn open_engine(cfg: &AppConfig, data_dir: &Path) -> anyhow::Result<Arc<Engine>> {
    std::fs::create_dir_all(data_dir).with_context(|| format!("create {}", data_dir.display()))?;
    let kv = RedbStore::open(data_dir.join(STORE_FILE))?;
    let engine = Engine::open(Arc::new(kv), cfg.engine.clone(), Some(data_dir.join(INDEX_FILE)))?;
    Ok(Arc::new(engine))
}
