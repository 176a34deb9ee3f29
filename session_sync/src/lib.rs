pub mod config;
pub mod coordinator;
pub mod errors;
pub mod fusion;
pub mod metadata;
pub mod observability;
pub mod recorder;
pub mod replication;
pub mod schedule;
pub mod server;
pub mod store;
