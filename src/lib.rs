pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod init;
pub mod logger;
pub mod persistence;
pub mod session;
pub mod stats;
pub mod tunnel;
