//! Relational store boundary: connection pool, row shapes, and the
//! repository traits the rest of the pipeline depends on (spec.md §6).

pub mod models;
pub mod pool;
pub mod repository;

pub use pool::Database;
pub use repository::{AddressRepository, MySqlStore};
