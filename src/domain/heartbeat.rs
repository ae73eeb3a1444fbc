//! Heartbeat liveness monitor.
//!
//! One recurring, self-rescheduling task per registered host. A run never
//! overlaps itself: the loop sleeps, completes a probe (or skips it), and
//! only then comes around again.
//!
//! Closing the connection is the only corrective action taken here. The
//! connection task observes the close, and normal teardown unregisters the
//! host; re-registration is the host's responsibility.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::error::Error;
use crate::server::ConnectionHandle;
use crate::types::ConnectionId;

use super::config::DomainConfig;
use super::metrics;
use super::registry::PingState;

/// Whether a probe window needs an active ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeDecision {
    /// Traffic was seen more recently than the interval; anything the host
    /// sends counts as liveness.
    Skip,
    Probe,
}

pub(crate) fn probe_decision(idle: Duration, interval: Duration) -> ProbeDecision {
    if idle < interval {
        ProbeDecision::Skip
    } else {
        ProbeDecision::Probe
    }
}

/// Verdict over a ping reply's connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyVerdict {
    Healthy,
    /// The id changed: the remote process restarted underneath the socket.
    Restarted {
        previous: ConnectionId,
        current: ConnectionId,
    },
}

pub(crate) fn classify_reply(
    expected: Option<ConnectionId>,
    reported: ConnectionId,
) -> ReplyVerdict {
    match expected {
        Some(previous) if previous != reported => ReplyVerdict::Restarted {
            previous,
            current: reported,
        },
        _ => ReplyVerdict::Healthy,
    }
}

/// Per-host liveness probe loop.
pub struct HeartbeatMonitor {
    host_name: String,
    connection: Arc<ConnectionHandle>,
    ping: PingState,
    interval: Duration,
    ping_timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        host_name: &str,
        connection: Arc<ConnectionHandle>,
        ping: PingState,
        config: &DomainConfig,
    ) -> Self {
        HeartbeatMonitor {
            host_name: host_name.to_string(),
            connection,
            ping,
            interval: config.heartbeat_interval,
            ping_timeout: config.ping_timeout,
        }
    }

    /// Start the probe loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::debug!(
            host = %self.host_name,
            interval_ms = self.interval.as_millis() as u64,
            "Heartbeat monitor started"
        );

        loop {
            sleep(self.interval).await;

            if self.ping.is_cancelled() || self.connection.is_closed() {
                break;
            }

            if probe_decision(self.connection.idle_for(), self.interval) == ProbeDecision::Skip {
                metrics::HEARTBEAT_PROBES.with_label_values(&["skipped"]).inc();
                tracing::trace!(host = %self.host_name, "Recent traffic, probe skipped");
                continue;
            }

            match timeout(self.ping_timeout, self.connection.ping()).await {
                Ok(Ok(reported)) => {
                    match classify_reply(self.ping.remote_connection_id(), reported) {
                        ReplyVerdict::Healthy => {
                            self.ping.record_connection_id(reported);
                            metrics::HEARTBEAT_PROBES
                                .with_label_values(&["healthy"])
                                .inc();
                        }
                        ReplyVerdict::Restarted { previous, current } => {
                            tracing::warn!(
                                host = %self.host_name,
                                previous = %previous,
                                current = %current,
                                "Connection id changed, remote process restarted; closing connection"
                            );
                            metrics::HEARTBEAT_PROBES
                                .with_label_values(&["desync"])
                                .inc();
                            self.connection.close();
                            break;
                        }
                    }
                }
                Ok(Err(Error::ConnectionClosed(_))) => {
                    // Closed under us; teardown already in progress.
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        host = %self.host_name,
                        error = ?e,
                        "Malformed ping reply; closing connection"
                    );
                    metrics::HEARTBEAT_PROBES
                        .with_label_values(&["protocol_error"])
                        .inc();
                    self.connection.close();
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        host = %self.host_name,
                        timeout_ms = self.ping_timeout.as_millis() as u64,
                        "Ping timed out, host unreachable; closing connection"
                    );
                    metrics::HEARTBEAT_PROBES
                        .with_label_values(&["timeout"])
                        .inc();
                    self.connection.close();
                    break;
                }
            }
        }

        tracing::debug!(host = %self.host_name, "Heartbeat monitor stopped");
    }
}
