pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod state;
