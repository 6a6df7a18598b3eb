//! Reading a change: history parser, immutable snapshot, cached loader.

pub mod loader;
pub mod parser;
pub mod state;

pub use loader::{ChangeNotesLoader, RebuildTrigger};
pub use parser::parse_change;
pub use state::{ChangeColumns, ChangeNotesState};
