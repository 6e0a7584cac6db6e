//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, capacities > 0, min <= max)
//! - Check that node names and addresses are unique and parseable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{GatewayConfig, PublisherKind};

/// Minimum pool capacity summed over all nodes.
pub const MIN_TOTAL_CONNECTIONS: usize = 3;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. Nodes
    if config.nodes.is_empty() {
        errors.push(ValidationError::new("nodes", "at least one ledger node is required"));
    }
    let mut names = HashSet::new();
    let mut addresses = HashSet::new();
    let mut total_connections = 0usize;
    for (i, node) in config.nodes.iter().enumerate() {
        let field = format!("nodes[{}]", i);
        if node.name.trim().is_empty() {
            errors.push(ValidationError::new(&field, "name must not be empty"));
        } else if !names.insert(node.name.as_str()) {
            errors.push(ValidationError::new(&field, format!("duplicate node name '{}'", node.name)));
        }
        if node.address.parse::<SocketAddr>().is_err() && !looks_like_host_port(&node.address) {
            errors.push(ValidationError::new(
                &field,
                format!("address '{}' is not host:port", node.address),
            ));
        }
        if !addresses.insert(node.address.as_str()) {
            errors.push(ValidationError::new(
                &field,
                format!("duplicate node address '{}'", node.address),
            ));
        }
        if node.max_connections == 0 {
            errors.push(ValidationError::new(&field, "max_connections must be > 0"));
        }
        total_connections += node.max_connections;
    }
    // Each pipeline's observer pins one connection for its subscription;
    // block fetches and settlement need at least one more.
    if !config.nodes.is_empty() && total_connections < MIN_TOTAL_CONNECTIONS {
        errors.push(ValidationError::new(
            "nodes",
            format!("at least {} connections in total are required", MIN_TOTAL_CONNECTIONS),
        ));
    }

    // 2. Pool
    let pool = &config.pool;
    for (name, value) in [
        ("pool.connect_timeout_secs", pool.connect_timeout_secs),
        ("pool.request_timeout_secs", pool.request_timeout_secs),
        ("pool.lease_timeout_secs", pool.lease_timeout_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(name, "must be > 0"));
        }
    }

    // 3. Health checks
    let hc = &config.health_check;
    if hc.enabled {
        if hc.interval_secs == 0 {
            errors.push(ValidationError::new("health_check.interval_secs", "must be > 0"));
        }
        if hc.timeout_secs == 0 {
            errors.push(ValidationError::new("health_check.timeout_secs", "must be > 0"));
        }
        if hc.healthy_threshold == 0 || hc.unhealthy_threshold == 0 {
            errors.push(ValidationError::new("health_check", "thresholds must be > 0"));
        }
    }

    // 4. Sync
    let sync = &config.sync;
    if sync.reconnect_min_secs > sync.reconnect_max_secs {
        errors.push(ValidationError::new(
            "sync.reconnect_min_secs",
            "must not exceed reconnect_max_secs",
        ));
    }
    if sync.batch_size == 0 {
        errors.push(ValidationError::new("sync.batch_size", "must be > 0"));
    }
    if sync.channel_capacity == 0 {
        errors.push(ValidationError::new("sync.channel_capacity", "must be > 0"));
    }
    if sync.idle_watchdog_secs == 0 {
        errors.push(ValidationError::new("sync.idle_watchdog_secs", "must be > 0"));
    }
    if sync.persist_retry_ms == 0 {
        errors.push(ValidationError::new("sync.persist_retry_ms", "must be > 0"));
    }

    // 5. Settlement
    let st = &config.settlement;
    if st.idle_min_secs > st.idle_max_secs {
        errors.push(ValidationError::new(
            "settlement.idle_min_secs",
            "must not exceed idle_max_secs",
        ));
    }
    if st.batch_limit == 0 {
        errors.push(ValidationError::new("settlement.batch_limit", "must be > 0"));
    }
    if st.fees.stable_min > st.fees.stable_max {
        errors.push(ValidationError::new(
            "settlement.fees.stable_min",
            "must not exceed stable_max",
        ));
    }

    // 6. Notify
    let notify = &config.notify;
    if notify.enabled && notify.publisher == PublisherKind::Webhook {
        match notify.webhook_url.as_deref().map(url::Url::parse) {
            None => errors.push(ValidationError::new(
                "notify.webhook_url",
                "required when publisher = \"webhook\"",
            )),
            Some(Err(e)) => errors.push(ValidationError::new(
                "notify.webhook_url",
                format!("invalid URL: {}", e),
            )),
            Some(Ok(_)) => {}
        }
    }
    if notify.base_delay_ms > notify.max_delay_ms {
        errors.push(ValidationError::new(
            "notify.base_delay_ms",
            "must not exceed max_delay_ms",
        ));
    }

    // 7. Observability
    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", obs.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn looks_like_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
