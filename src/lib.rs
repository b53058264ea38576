pub mod config;
pub mod error;
pub mod hls;
pub mod metrics;
pub mod probe;
pub mod relay;
pub mod server;
pub mod upstream;
pub mod url_validation;
