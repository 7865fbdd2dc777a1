pub mod batch;
pub mod cache;
pub mod clustersync;
pub mod config;
pub mod db;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod server;
