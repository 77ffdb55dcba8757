use crate::config::types::{ApiConfig, Config, CrawlerConfig, OutputConfig, RetryConfig, TargetEntry};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_api_config(&config.api)?;
    validate_crawler_config(&config.crawler)?;
    validate_retry_config(&config.retry)?;
    validate_output_config(&config.output)?;
    validate_targets(&config.targets)?;
    Ok(())
}

/// Validates the search API description
fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.endpoint)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid endpoint: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "Endpoint '{}' must use http or https",
            config.endpoint
        )));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "timeout-secs must be >= 1".to_string(),
        ));
    }

    for (name, value) in [
        ("items-field", &config.items_field),
        ("total-field", &config.total_field),
        ("key-field", &config.key_field),
        ("dimension-field", &config.dimension_field),
        ("min-filter", &config.min_filter),
        ("max-filter", &config.max_filter),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }

    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.result_window == 0 {
        return Err(ConfigError::Validation(
            "result-window must be >= 1".to_string(),
        ));
    }

    if config.window_margin >= config.result_window {
        return Err(ConfigError::Validation(format!(
            "window-margin ({}) must be smaller than result-window ({})",
            config.window_margin, config.result_window
        )));
    }

    if config.page_size < 1 || config.page_size > config.result_window {
        return Err(ConfigError::Validation(format!(
            "page-size must be between 1 and result-window ({}), got {}",
            config.result_window, config.page_size
        )));
    }

    if config.min_slice < 1 {
        return Err(ConfigError::Validation(format!(
            "min-slice must be >= 1, got {}",
            config.min_slice
        )));
    }

    if config.max_pages == Some(0) {
        return Err(ConfigError::Validation(
            "max-pages must be >= 1 when set".to_string(),
        ));
    }

    if config.concurrency < 1 || config.concurrency > 64 {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and 64, got {}",
            config.concurrency
        )));
    }

    Ok(())
}

/// Validates the retry policy
fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(
            "max-attempts must be >= 1".to_string(),
        ));
    }

    if config.base_delay > config.max_delay {
        return Err(ConfigError::Validation(format!(
            "base-delay ({}ms) cannot exceed max-delay ({}ms)",
            config.base_delay, config.max_delay
        )));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates crawl targets
fn validate_targets(targets: &[TargetEntry]) -> Result<(), ConfigError> {
    if targets.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[target]] is required".to_string(),
        ));
    }

    for target in targets {
        if target.transaction.trim().is_empty() {
            return Err(ConfigError::Validation(
                "target transaction cannot be empty".to_string(),
            ));
        }

        if target.categories.is_empty() || target.categories.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "Target '{}' must list at least one non-empty category",
                target.transaction
            )));
        }

        if target.zones.iter().any(|z| z.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "Target '{}' contains an empty zone",
                target.transaction
            )));
        }

        if target.ranges.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Target '{}' must have at least one range",
                target.transaction
            )));
        }

        for [low, high] in &target.ranges {
            validate_range(*low, *high)?;
        }
    }

    Ok(())
}

/// Validates one coarse range
fn validate_range(low: i64, high: i64) -> Result<(), ConfigError> {
    if low < 0 {
        return Err(ConfigError::Validation(format!(
            "Range [{}, {}) cannot start below zero",
            low, high
        )));
    }

    if low >= high {
        return Err(ConfigError::Validation(format!(
            "Range [{}, {}) must have low < high",
            low, high
        )));
    }

    Ok(())
}
