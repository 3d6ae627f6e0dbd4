//! Tracing subscriber initialization, grounded on
//! `gjwang-zero_x_infinity::logging` (stdout layer + configurable
//! filter + optional JSON layer) minus the file-rotation concern the
//! teacher's sibling component handles, which this service doesn't need.

use crate::config::LogConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}
