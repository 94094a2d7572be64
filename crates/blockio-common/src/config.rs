//! Client configuration.
//!
//! Defaults mirror what the production deployments run with; everything is
//! serde-serializable so a daemon can embed this in its own config file.

use crate::types::Features;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the blockio client
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Format used by `create` when the caller does not pick one explicitly.
    /// 1 selects the legacy layout, anything else the modern layout.
    pub default_format: u8,
    /// Default object size exponent (object size = 2^order)
    pub default_order: u8,
    /// Features enabled on newly created modern-format images
    pub default_features: Features,
    /// Default stripe unit in bytes (0 = object size)
    pub default_stripe_unit: u64,
    /// Default stripe count (0 = no striping)
    pub default_stripe_count: u64,
    /// Concurrency bound for long-running maintenance ops
    /// (trim, rollback, flatten, copy, rebuild)
    pub concurrent_management_ops: usize,
    /// Suppress the zero-fill case of discard for extents that cover the
    /// middle of an object
    pub skip_partial_discard: bool,
    /// Deadline for a notification round-trip to the lock owner
    pub notify_timeout: Duration,
    /// How many times a suspended write retries lock acquisition before
    /// giving up with a timeout
    pub request_lock_retries: u32,
    /// Delay between lock-acquisition retries
    pub request_lock_backoff: Duration,
    /// Bounded RESTART retries inside the async-request envelope
    pub max_restart_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_format: 2,
            default_order: 22, // 4 MiB objects
            default_features: Features::LAYERING | Features::EXCLUSIVE_LOCK,
            default_stripe_unit: 0,
            default_stripe_count: 0,
            concurrent_management_ops: 10,
            skip_partial_discard: false,
            notify_timeout: Duration::from_secs(5),
            request_lock_retries: 10,
            request_lock_backoff: Duration::from_millis(250),
            max_restart_retries: 1,
        }
    }
}

/// Valid range for the object size exponent
pub const MIN_ORDER: u8 = 12;
pub const MAX_ORDER: u8 = 25;

impl ClientConfig {
    /// Validate order bounds for create/clone
    pub fn check_order(order: u8) -> Result<(), String> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(format!(
                "order must be in the range [{MIN_ORDER}, {MAX_ORDER}], got {order}"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let cfg = ClientConfig::default();
        assert!(ClientConfig::check_order(cfg.default_order).is_ok());
        assert!(cfg.default_features.validate().is_ok());
        assert!(cfg.concurrent_management_ops > 0);
    }

    #[test]
    fn test_order_bounds() {
        assert!(ClientConfig::check_order(12).is_ok());
        assert!(ClientConfig::check_order(25).is_ok());
        assert!(ClientConfig::check_order(11).is_err());
        assert!(ClientConfig::check_order(26).is_err());
    }
}
