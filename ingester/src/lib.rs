pub mod batch;
pub mod config;
pub mod error;
pub mod excerpt;
pub mod metrics_consts;
pub mod parse;
pub mod sink;
pub mod sinks;
pub mod types;
pub mod worker;
