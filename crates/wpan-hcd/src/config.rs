//! Controller tunables, their defaults and the ticks derived from them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest number of root hub ports that still fits the two-byte hub status bitmap (bit 0 is
/// reserved for the hub itself).
pub const MAX_PORT_COUNT: usize = 15;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port_count must be in 1..={max} (got {got})")]
    PortCount { got: usize, max: usize },

    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("link_pool_capacity ({pool}) exceeds max_outstanding_links ({limit})")]
    PoolLargerThanLimit { pool: usize, limit: usize },
}

/// Tunables for a [`crate::Controller`].
///
/// All values have defaults matching the reference hardware cadence (8ms heartbeats, 8 ports), so
/// hosts usually only override a couple of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HcdConfig {
    /// Number of virtual root hub ports.
    pub port_count: usize,

    /// Number of idle link records kept for reuse.
    pub link_pool_capacity: usize,

    /// Upper bound on live link records (pooled records excluded).
    ///
    /// When set, `acquire` fails with `OutOfMemory` instead of allocating past the limit. `None`
    /// means "bounded only by the heap".
    pub max_outstanding_links: Option<usize>,

    /// Ring buffer size for isochronous IN endpoints, in bytes.
    pub isoc_buffer_size: usize,

    /// Ring buffer size for interrupt IN endpoints, in bytes.
    pub interrupt_buffer_size: usize,

    /// Upper bound on accumulated isochronous credit, in packets.
    pub isoc_credit_ceiling: i32,

    /// Period at which the transport invokes the heartbeat.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Wall-clock time after which an unanswered control request is resent to the peer.
    #[serde(with = "duration_ms")]
    pub ep0_resend_timeout: Duration,

    /// Rounding added to the elapsed time before it is converted to isochronous IN credit.
    #[serde(with = "duration_us")]
    pub isoc_in_credit_rounding: Duration,
}

impl Default for HcdConfig {
    fn default() -> Self {
        Self {
            port_count: 8,
            link_pool_capacity: 16,
            max_outstanding_links: None,
            isoc_buffer_size: 24 * 1024,
            interrupt_buffer_size: 512,
            isoc_credit_ceiling: 200,
            heartbeat_interval: Duration::from_millis(8),
            ep0_resend_timeout: Duration::from_millis(104),
            isoc_in_credit_rounding: Duration::from_micros(5),
        }
    }
}

impl HcdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_count == 0 || self.port_count > MAX_PORT_COUNT {
            return Err(ConfigError::PortCount {
                got: self.port_count,
                max: MAX_PORT_COUNT,
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "heartbeat_interval",
            });
        }
        if self.isoc_buffer_size == 0 {
            return Err(ConfigError::Zero {
                field: "isoc_buffer_size",
            });
        }
        if self.interrupt_buffer_size == 0 {
            return Err(ConfigError::Zero {
                field: "interrupt_buffer_size",
            });
        }
        if self.isoc_credit_ceiling <= 0 {
            return Err(ConfigError::Zero {
                field: "isoc_credit_ceiling",
            });
        }
        if let Some(limit) = self.max_outstanding_links {
            if limit == 0 {
                return Err(ConfigError::Zero {
                    field: "max_outstanding_links",
                });
            }
            if self.link_pool_capacity > limit {
                return Err(ConfigError::PoolLargerThanLimit {
                    pool: self.link_pool_capacity,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Number of heartbeat ticks an armed control request may stay unanswered before it is resent.
    ///
    /// Derived from the wall-clock timeout so a different heartbeat cadence keeps the same
    /// effective timeout.
    pub fn ep0_resend_ticks(&self) -> u32 {
        let interval = self.heartbeat_interval.as_nanos().max(1);
        let ticks = self.ep0_resend_timeout.as_nanos().div_ceil(interval);
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_us {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}
