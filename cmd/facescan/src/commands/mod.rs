//! CLI commands.

mod library;
mod scan;
mod util;

pub use library::{ClustersCommand, HistoryCommand, MergeCommand, RefineCommand, StatusCommand, UndoCommand};
pub use scan::ScanCommand;

pub(crate) use util::*;
