use std::time::Duration;

/// Default upper bound for a single scan.
pub const DEFAULT_MAX_SCAN_DURATION: Duration = Duration::from_secs(30 * 60);

/// Timeouts applied to every suspending operation of a device session.
///
/// These are deliberately configuration rather than constants. The
/// defaults match common central-role expectations: 10 seconds to
/// establish a connection, 5 seconds for any single GATT exchange, and
/// a 5 second hard bound on teardown after which the session is forced
/// into an error state instead of hanging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Time allowed for the link to come up before `ConnectionTimeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Deadline for a single read/write/discovery/subscription exchange.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Hard upper bound on graceful teardown.
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}
