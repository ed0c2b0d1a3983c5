//! Database layer for Larder

mod connection;
mod migrations;
mod repository;

pub use connection::Database;
pub use repository::LibSqlRecordRepository;
