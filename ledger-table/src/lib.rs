pub mod error;
pub mod table;

pub use error::{Result, TableError};
pub use table::{Cell, CellUpdate, InsertOutcome, LedgerTable};
