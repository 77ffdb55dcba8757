//! Configuration module for the harvester
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use listing_harvester::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvester.toml")).unwrap();
//! println!("Window limit: {}", config.crawler.window_limit());
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    ApiConfig, Config, CrawlerConfig, OutputConfig, RetryConfig, TargetEntry, UpperBound,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash};
