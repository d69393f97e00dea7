//! Default configuration values
//!
//! Used by the `Default` impls in [`crate::delivery_config`] and therefore
//! whenever a key is missing from the TOML file.

/// Producer controller defaults
pub mod producer_controller {
    /// Maximum number of sent-but-unconfirmed messages
    pub const SEND_BUFFER_CAPACITY: usize = 1_000;

    /// Messages whose serialized size exceeds this are chunked (0 disables)
    pub const CHUNK_LARGE_MESSAGES_BYTES: usize = 0;

    /// Resend the first unconfirmed message after this much silence (milliseconds)
    pub const RESEND_FIRST_UNCONFIRMED_IDLE_TIMEOUT_MS: u64 = 10_000;
}

/// Durable producer queue defaults
pub mod durable_queue {
    /// Timeout of a single store/load request (milliseconds)
    pub const REQUEST_TIMEOUT_MS: u64 = 3_000;

    /// Attempts before a failing request is escalated
    pub const RETRY_ATTEMPTS: u32 = 10;

    /// Initial backoff between attempts (milliseconds)
    pub const RETRY_BACKOFF_MS: u64 = 100;

    /// Backoff ceiling (milliseconds)
    pub const MAX_RETRY_BACKOFF_MS: u64 = 5_000;

    /// Interval for resending the first message until the consumer answers (milliseconds)
    pub const RESEND_FIRST_INTERVAL_MS: u64 = 1_000;
}

/// Consumer controller defaults
pub mod consumer_controller {
    /// Messages requested ahead of the confirmed sequence number
    pub const FLOW_CONTROL_WINDOW: u32 = 50;

    /// Idle re-request interval, doubled while nothing arrives (milliseconds)
    pub const RESEND_INTERVAL_MIN_MS: u64 = 2_000;

    /// Upper bound for the idle re-request interval (milliseconds)
    pub const RESEND_INTERVAL_MAX_MS: u64 = 30_000;
}

/// Sharding defaults
pub mod sharding {
    /// Messages buffered for entities without demand, across all entities
    pub const BUFFER_SIZE: usize = 1_000;

    /// Idle time after which an entity's producer controller is torn down (milliseconds)
    pub const CLEANUP_UNUSED_AFTER_MS: u64 = 120_000;
}

/// Restart supervision defaults
pub mod supervision {
    pub const MAX_RESTARTS: u32 = 5;

    /// Window in which `MAX_RESTARTS` applies (milliseconds)
    pub const RESTART_WINDOW_MS: u64 = 60_000;

    pub const MIN_BACKOFF_MS: u64 = 100;

    pub const MAX_BACKOFF_MS: u64 = 10_000;
}
