use std::time::Duration;

use log::LevelFilter;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WORKERS: usize = 64;
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_CAPTURE_QUEUE: usize = 1024;

/// Process-wide settings, built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Host name the proxy answers to. Also the address the listener binds.
    pub host: String,
    pub port: u16,
    pub log_level: LevelFilter,
    /// Run the raw packet observer next to the proxy.
    pub trace_packets: bool,
    /// Size of the session worker pool.
    pub workers: usize,
    /// Interval of the observer's resume check.
    pub observer_tick: Duration,
    /// Frames the capture reader may queue before it pauses.
    pub capture_queue: usize,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Whether `host:port` could lead back to this proxy.
    ///
    /// Either part matching is enough: the listen port reached through any
    /// alias of the host (`localhost`, another interface) is still this proxy.
    pub fn is_self(&self, host: &str, port: u16) -> bool {
        port == self.port || host.eq_ignore_ascii_case(&self.host)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            log_level: LevelFilter::Info,
            trace_packets: false,
            workers: DEFAULT_WORKERS,
            observer_tick: DEFAULT_TICK,
            capture_queue: DEFAULT_CAPTURE_QUEUE,
        }
    }
}
