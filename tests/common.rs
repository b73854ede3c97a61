#![allow(missing_docs, reason = "test helpers")]
#![allow(dead_code, reason = "not every test binary uses every helper")]

use interval_host::{Host, HostConfig};
use test_util::MockDashboard;

/// A configuration pointed at the mock dashboard with test-friendly
/// timings.
pub fn test_config(dashboard: &MockDashboard) -> HostConfig {
    let mut config = HostConfig::new("test_key").with_endpoint(dashboard.endpoint());
    config.retry_interval_ms = 50;
    config.reinitialize_batch_timeout_ms = 50;
    config.send_timeout_ms = 2_000;
    config.connect_timeout_ms = 2_000;
    // keep liveness probes out of call logs
    config.ping_interval_ms = 60_000;
    config
}

/// Build a host against the dashboard; routes are added by the caller
/// before `listen`.
pub fn test_host(dashboard: &MockDashboard) -> Host {
    Host::new(test_config(dashboard)).expect("build host")
}
