//! libSQL-backed mirror store

mod connection;
mod migrations;
mod mirror_repository;

pub use connection::{Database, RemoteConfig};
pub use mirror_repository::LibSqlMirrorStore;
