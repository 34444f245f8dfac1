pub mod connection;
pub mod crud;
pub mod models;

pub use connection::*;
pub use models::*;
