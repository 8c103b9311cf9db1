// ── Bridge configuration ──
//
// Everything the core needs at runtime, already resolved. The config
// crate translates settings files and env into this.

use std::time::Duration;

/// Runtime configuration for the supervisor and registry.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Delay before a failed link start is retried. Also bounds how long
    /// `stop()` waits for an in-flight start.
    pub retry_interval: Duration,
    /// Silence on the link for this long triggers a soft reset.
    pub idle_timeout: Duration,
    /// Wall-clock budget for one device configure routine.
    pub configure_timeout: Duration,
    /// Endpoint on the coordinator that devices bind reports to.
    pub coordinator_endpoint: u8,
    /// Host of a TCP-attached coordinator; exposed as the `ip` telemetry.
    pub connection_ip: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10 * 60),
            configure_timeout: Duration::from_secs(60),
            coordinator_endpoint: 1,
            connection_ip: None,
        }
    }
}
