//! Bus configuration.

use std::time::Duration;

use crate::{BusError, Result};

/// Configuration for an [`EventBus`](crate::EventBus).
///
/// The default configuration disables the timing monitor, event caching, and
/// the reaper.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Longest a vetoer or subscriber call may run before a
    /// [`SubscriberTimingEvent`](crate::SubscriberTimingEvent) is published.
    /// `None` disables the timing monitor.
    pub time_threshold: Option<Duration>,
    /// Subscribe a built-in warn-level logger for timing events. Requires
    /// `time_threshold` to be set.
    pub log_timing_events: bool,
    /// Cache cap applied to keys with no class, topic, or pattern cap.
    pub default_cache_size: usize,
    /// Weak/proxy cell count at which the reaper thread starts. `None`
    /// disables starting.
    pub cleanup_start_threshold: Option<usize>,
    /// Count at or below which a running reaper cancels itself. `None`
    /// compares as zero.
    pub cleanup_stop_threshold: Option<usize>,
    /// Interval between reaper ticks. `None` disables the reaper.
    pub cleanup_period: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            time_threshold: None,
            log_timing_events: false,
            default_cache_size: 0,
            cleanup_start_threshold: None,
            cleanup_stop_threshold: None,
            cleanup_period: None,
        }
    }
}

impl BusConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.log_timing_events && self.time_threshold.is_none() {
            return Err(BusError::InvalidArgument(
                "log_timing_events requires a time_threshold".to_owned(),
            ));
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
