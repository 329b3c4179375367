pub mod relational;
pub mod sqlite;
pub mod warehouse;

pub use relational::SqliteRelational;
pub use sqlite::SqliteStore;
pub use warehouse::HttpWarehouse;
