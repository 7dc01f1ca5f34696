pub mod ledger;
pub mod memory_ledger;
pub mod models;
pub mod sqlite_ledger;

pub use ledger::*;
pub use memory_ledger::*;
pub use models::*;
pub use sqlite_ledger::*;
