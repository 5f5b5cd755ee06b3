//! Library crate for lan-recon exposing the scan engine and its collaborators.
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod netdetect;
pub mod orchestrator;
pub mod parser;
pub mod pool;
pub mod ports;
pub mod process;
pub mod progress;
pub mod reports;
pub mod server;
pub mod sqlite;
pub mod store;
pub mod types;
pub mod worker;
