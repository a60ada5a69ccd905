pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod server_state;
pub mod sqlite_stores;

pub use error::ServerError;
