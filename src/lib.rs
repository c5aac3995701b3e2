//! An embedded transactional SQL engine over the SQLite file format.

pub mod config;
pub mod connection;
pub mod executor;
pub mod planner;
pub mod storage;
pub mod types;
pub mod utils;

pub use config::{DatabaseConfig, JournalMode, Synchronous};
pub use connection::{Connection, Engine, InterruptHandle, Rows, Statement};
pub use planner::types::TransactionMode;
pub use types::{
    error::{DatabaseError, Result},
    row::Row,
    value::Value,
};
