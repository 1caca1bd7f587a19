pub mod collector;
pub mod config;
pub mod connections;
pub mod execution;
pub mod functions;
pub mod logging;
pub mod maintenance;
pub mod models;
pub mod partition;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;
