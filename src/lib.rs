pub mod cleaning;
pub mod config;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod tracking;
