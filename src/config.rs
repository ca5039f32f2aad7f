#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum interval between gap scans driven by `heartbeat()`.
    pub heartbeat_interval_ms: i64,
    /// Patches older than this are garbage collected. The default of 25
    /// hours gives a daily sync window a full day of slack.
    pub max_patch_retention_ms: i64,
    /// Cap on the sequence range of a single missing-patch request.
    pub max_patch_per_retransmission: i64,
    /// Log gap detection events.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            max_patch_retention_ms: 90_000_000,
            max_patch_per_retransmission: 2_000,
            debug: false,
        }
    }
}
