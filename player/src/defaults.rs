pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_SNAPSHOT_PATH: &str = "rochambeau-snapshot.json";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_JSON_LOGS: bool = false;

pub const DEFAULT_STAKE: u64 = 10;
/// Bound on a single historical call lookup before trying the other caller.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_VERIFY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_CALL_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
pub const DEFAULT_MAX_RETRY_BACKOFF_MS: u64 = 4_000;
pub const DEFAULT_LOG_RETENTION_ROUNDS: usize = 32;
pub const DEFAULT_AUTOPLAY_ROUNDS: u64 = 3;
pub const DEFAULT_EVENT_BUFFER: usize = 1_024;
pub const DEFAULT_NOTIFICATION_BUFFER: usize = 256;
