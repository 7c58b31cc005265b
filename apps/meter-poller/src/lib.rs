pub mod backfill;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod model;
pub mod observations;
pub mod restore;
pub mod scheduler;
pub mod services;
pub mod store;
pub(crate) mod time;
