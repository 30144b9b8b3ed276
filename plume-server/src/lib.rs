pub mod adapter;
pub mod config;
pub mod error;
pub mod protocol;
pub mod routes;

pub use adapter::{AdapterConfig, DiffusersModel};
pub use error::AdapterError;
