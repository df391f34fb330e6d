use std::time::Duration;

// connections
pub const DEFAULT_SERVICE_PORT: u16 = 5002;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

// frame ordering
pub const DEFAULT_REORDER_DEPTH: usize = 5;

// display / save queues
pub const SINK_QUEUE_CAPACITY: usize = 5;
pub const STOP_FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);
pub const SINK_FLUSH_POLL: Duration = Duration::from_millis(5);
/// Longest wait for room in a sink queue when closing a session's files
pub const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// request rate measurement
pub const RATE_WINDOW_SIZE: usize = 10;
pub const RATE_COMPUTE_PERIOD: Duration = Duration::from_millis(1000);

// persistence layout
pub const TIMESTAMP_LOG_NAME: &str = "timestamps.txt";
pub const MAX_CAMERAS: usize = 2;
