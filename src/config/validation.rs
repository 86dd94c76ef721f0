//! Startup validation of the loaded configuration
//!
//! Catches operator mistakes before any subsystem starts. Every rejected
//! value names the offending field so the error is actionable from the log.

use super::{AgentConfig, ConfigError};

/// Validate cross-field constraints that serde cannot express.
pub fn validate(config: &AgentConfig) -> Result<(), ConfigError> {
    if config.signal_pipeline_size == 0 {
        return Err(invalid("signal_pipeline_size must be greater than zero"));
    }
    if config.upload_queue_size == 0 {
        return Err(invalid("upload_queue_size must be greater than zero"));
    }
    if config.inspection_idle_time_ms == 0 {
        return Err(invalid("inspection_idle_time_ms must be greater than zero"));
    }
    if config.collection_scheme_manager_idle_time_ms == 0 {
        return Err(invalid(
            "collection_scheme_manager_idle_time_ms must be greater than zero",
        ));
    }
    if config.checkin_interval_ms == 0 {
        return Err(invalid("checkin_interval_ms must be greater than zero"));
    }
    if config.document_poll_interval_ms == 0 {
        return Err(invalid("document_poll_interval_ms must be greater than zero"));
    }
    if config.transport.endpoint.is_empty() {
        return Err(invalid("transport.endpoint must not be empty"));
    }
    if config.transport.client_id.is_empty() {
        return Err(invalid("transport.client_id must not be empty"));
    }
    if config.persistency.path.as_os_str().is_empty() {
        return Err(invalid("persistency.path must not be empty"));
    }

    let mut seen = std::collections::HashSet::new();
    let mut reserved_total: u64 = 0;
    for entry in &config.raw_data_buffer.signals {
        if !seen.insert(entry.signal_id) {
            return Err(invalid(&format!(
                "raw_data_buffer.signals has a duplicate entry for signal {}",
                entry.signal_id
            )));
        }
        if entry.max_bytes == 0 || entry.max_samples == 0 {
            return Err(invalid(&format!(
                "raw_data_buffer.signals[{}]: max_bytes and max_samples must be greater than zero",
                entry.signal_id
            )));
        }
        if entry.max_bytes_per_sample > entry.max_bytes {
            return Err(invalid(&format!(
                "raw_data_buffer.signals[{}]: max_bytes_per_sample exceeds max_bytes",
                entry.signal_id
            )));
        }
        if entry.reserved_bytes > entry.max_bytes {
            return Err(invalid(&format!(
                "raw_data_buffer.signals[{}]: reserved_bytes exceeds max_bytes",
                entry.signal_id
            )));
        }
        reserved_total = reserved_total.saturating_add(entry.reserved_bytes);
    }
    if reserved_total > config.raw_data_buffer.global_max_bytes {
        return Err(invalid(
            "raw_data_buffer: sum of reserved_bytes exceeds global_max_bytes",
        ));
    }

    Ok(())
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}
