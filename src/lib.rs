pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod governor;
pub mod rpc;
pub mod shutdown;
pub mod state;
