use std::time::Duration;

use courier_shared::constants::{
    FRAME_BURST, FRAME_RATE, PING_INTERVAL_SECS, READ_IDLE_TIMEOUT_SECS, RECOVERY_MAX_PAGES,
    RECOVERY_PAGE_SIZE, TYPING_STALE_SECS, TYPING_SWEEP_SECS, WRITE_TIMEOUT_SECS,
};

/// Engine timings and limits.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Deadline for one outbound frame, including waiting for the sink.
    pub write_timeout: Duration,
    /// A connection with no inbound frame for this long is dropped.
    pub read_idle_timeout: Duration,
    pub ping_interval: Duration,
    pub typing_stale: Duration,
    pub typing_sweep: Duration,
    pub recovery_page_size: usize,
    pub recovery_max_pages: usize,
    /// Sustained inbound frames per second per connection.
    pub frame_rate: f64,
    pub frame_burst: f64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(WRITE_TIMEOUT_SECS),
            read_idle_timeout: Duration::from_secs(READ_IDLE_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            typing_stale: Duration::from_secs(TYPING_STALE_SECS),
            typing_sweep: Duration::from_secs(TYPING_SWEEP_SECS),
            recovery_page_size: RECOVERY_PAGE_SIZE,
            recovery_max_pages: RECOVERY_MAX_PAGES,
            frame_rate: FRAME_RATE,
            frame_burst: FRAME_BURST,
        }
    }
}
