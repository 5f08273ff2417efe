pub mod benchmark;
pub mod config;
pub mod database;
pub mod dataset;
pub mod engine;
pub mod exec;
pub mod host;
pub mod sync;
pub mod system;
pub mod verify;
