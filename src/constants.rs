//! Global constants for dsmbuf
//!
//! Channel tags, status codes and size defaults shared by every rank.
//! Two ranks built with different values here cannot talk to each other.

/// Reserved channel tags
///
/// Each message stream travels on its own tag so that an acknowledgement
/// can never be mistaken for a payload or a command header.
pub mod tags {
    /// Untagged traffic
    pub const DEFAULT: i32 = 0x80;
    /// Command headers (`CommandHeader`)
    pub const COMMAND: i32 = 0x81;
    /// Acknowledgements flowing server -> client
    pub const SERVER_ACK: i32 = 0x82;
    /// Acknowledgements flowing client -> server
    pub const CLIENT_ACK: i32 = 0x83;
    /// Payload following a PUT header
    pub const PUT_DATA: i32 = 0x84;
    /// Payload answering a GET header
    pub const GET_DATA: i32 = 0x85;
    /// Names, info messages, file descriptions and lock grants
    pub const EXCHANGE: i32 = 0x86;
    /// Worker-side barriers
    pub const BARRIER: i32 = 0x87;

    /// Wildcard encoding for "any tag"
    pub const ANY_TAG: i32 = -1;
    /// Wildcard encoding for "any source"
    pub const ANY_SOURCE: i32 = -2;
}

/// Status values carried by acknowledgements
pub const STATUS_SUCCESS: i32 = 1;
pub const STATUS_FAIL: i32 = -1;

/// Magic number opening every TCP link handshake ("DSMBUF01")
pub const LINK_MAGIC: u64 = 0x44534D4255463031;

/// Maximum length of a lock, notify or file name (bytes)
pub const MAX_NAME_LENGTH: usize = 4096;

/// Number of idle poll iterations before the service loop starts sleeping
pub const SERVICE_SPIN_LIMIT: u32 = 64;

/// Sleep between idle polls once the spin budget is exhausted (microseconds)
pub const SERVICE_IDLE_SLEEP_US: u64 = 100;

/// Size defaults
pub mod defaults {
    /// Per-rank length used when nothing else is configured
    pub const DEFAULT_LENGTH: u64 = 10000;

    /// Page size for block layouts
    pub const DEFAULT_BLOCK_LENGTH: u64 = 1024;

    /// Per-rank segment size in MiB
    pub const DEFAULT_BUFFER_SIZE_MB: u64 = 128;

    /// Alignment the local segment length is rounded to when derived from MiB
    pub const SEGMENT_ALIGNMENT: u64 = 4096;
}

/// Whether the service loop should log every dispatched header
///
/// Enabled by `DSMBUF_TRACE_HEADERS=1`. Checked once per process.
pub fn trace_headers() -> bool {
    use std::sync::OnceLock;

    static CACHE: OnceLock<bool> = OnceLock::new();
    *CACHE.get_or_init(|| {
        let enabled = is_env_truthy("DSMBUF_TRACE_HEADERS");
        if enabled {
            tracing::info!("Header tracing enabled via DSMBUF_TRACE_HEADERS");
        }
        enabled
    })
}

pub(crate) fn is_env_truthy(key: &str) -> bool {
    use std::env;

    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
