/// Deadline for a single outbound frame write, in seconds
pub const WRITE_TIMEOUT_SECS: u64 = 10;

/// Idle read deadline; reset by every inbound frame (pongs included)
pub const READ_IDLE_TIMEOUT_SECS: u64 = 60;

/// Interval between keepalive pings
pub const PING_INTERVAL_SECS: u64 = 30;

/// A typing indicator with no refresh for this long is treated as stopped
pub const TYPING_STALE_SECS: u64 = 10;

/// How often the typing sweep runs
pub const TYPING_SWEEP_SECS: u64 = 5;

/// Page size used by reconnect recovery
pub const RECOVERY_PAGE_SIZE: usize = 100;

/// Upper bound on pages drained by a single recovery run
pub const RECOVERY_MAX_PAGES: usize = 10;

/// Maximum inbound text frame size in bytes (64 KiB)
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Sustained inbound frames per second per connection
pub const FRAME_RATE: f64 = 20.0;

/// Inbound frame burst allowance per connection
pub const FRAME_BURST: f64 = 60.0;

/// Default history page size
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Hard cap on history/search page size
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Characters of message content kept in a group's last-message preview
pub const LAST_MESSAGE_PREVIEW_CHARS: usize = 120;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
