pub mod database;
pub mod error;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod usage;

pub use database::Database;
pub use error::StoreError;
pub use memory::InMemoryUsageStore;
pub use usage::{SqliteUsageStore, UsageStore};
