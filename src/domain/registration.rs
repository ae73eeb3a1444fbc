//! Registration handshake state tracking.
//!
//! The handshake itself runs in the controller's register handler; this
//! module owns the per-attempt state: the handshake state machine, the
//! one-shot completion signal the prepare phase parks on, and the in-flight
//! map that makes concurrent duplicate registrations fail deterministically.
//!
//! ```text
//! INITIATED → MODEL_SENT → { COMMITTED | FAILED }
//! ```

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::oneshot;

use super::error::{DomainError, DomainResult};

/// Phase of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// REGISTER received; nothing shared touched yet.
    Initiated,
    /// Snapshot sent; waiting for the host to apply it and report back.
    ModelSent,
    /// Host committed; per-host state installed. Terminal.
    Committed,
    /// Rolled back, conflicted, or the connection died. Terminal.
    Failed,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Initiated => write!(f, "initiated"),
            RegistrationState::ModelSent => write!(f, "model-sent"),
            RegistrationState::Committed => write!(f, "committed"),
            RegistrationState::Failed => write!(f, "failed"),
        }
    }
}

/// How a parked registration attempt was released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionSignal {
    /// The host applied the snapshot and committed.
    Commit,
    /// The host applied the snapshot and rolled back.
    Rollback { message: Option<String> },
    /// The connection died before a well-formed COMPLETE arrived.
    ConnectionFailed,
}

/// Ephemeral state of one registration attempt.
pub struct PendingRegistration {
    host_name: String,
    /// Connection the attempt arrived on; a COMPLETE or teardown from any
    /// other connection must not touch this attempt.
    connection: uuid::Uuid,
    signal: std::sync::Mutex<Option<oneshot::Sender<CompletionSignal>>>,
    state: std::sync::Mutex<RegistrationState>,
    /// Parties currently holding the attempt (prepare waiter, completion
    /// handler, close path). The map entry is removed by the last one out.
    waiters: AtomicUsize,
}

impl PendingRegistration {
    fn new(
        host_name: &str,
        connection: uuid::Uuid,
    ) -> (Arc<Self>, oneshot::Receiver<CompletionSignal>) {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(PendingRegistration {
            host_name: host_name.to_string(),
            connection,
            signal: std::sync::Mutex::new(Some(tx)),
            state: std::sync::Mutex::new(RegistrationState::Initiated),
            waiters: AtomicUsize::new(0),
        });
        (pending, rx)
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn connection(&self) -> uuid::Uuid {
        self.connection
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.lock().expect("registration state lock poisoned")
    }

    /// Advance the state machine.
    pub fn transition(&self, to: RegistrationState) {
        let mut state = self.state.lock().expect("registration state lock poisoned");
        tracing::debug!(
            host = %self.host_name,
            from = %*state,
            to = %to,
            "Registration state transition"
        );
        *state = to;
    }

    /// Fire the one-shot completion signal. Only the first caller wins;
    /// later signals (e.g. a connection close racing a COMPLETE) are
    /// dropped.
    pub fn complete(&self, signal: CompletionSignal) -> bool {
        let sender = self
            .signal
            .lock()
            .expect("registration signal lock poisoned")
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(signal);
                true
            }
            None => false,
        }
    }

    /// Release the parked waiter because the connection died.
    pub fn cancel(&self) -> bool {
        self.complete(CompletionSignal::ConnectionFailed)
    }
}

/// Shared reference to an attempt, counted into its waiter refcount.
///
/// Dropping the guard releases the count; the last guard out removes the
/// in-flight map entry, so a late COMPLETE can never touch a newer attempt
/// for the same host name.
pub struct PendingGuard<'a> {
    registrations: &'a PendingRegistrations,
    pending: Arc<PendingRegistration>,
}

impl std::fmt::Debug for PendingGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingGuard")
            .field("host_name", &self.pending.host_name())
            .field("connection", &self.pending.connection())
            .finish_non_exhaustive()
    }
}

impl PendingGuard<'_> {
    /// Plain shared reference to the attempt, without a waiter count.
    /// Valid to hold only while some guard keeps the attempt alive.
    pub fn share(&self) -> Arc<PendingRegistration> {
        self.pending.clone()
    }
}

impl Deref for PendingGuard<'_> {
    type Target = PendingRegistration;

    fn deref(&self) -> &Self::Target {
        &self.pending
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registrations.release(&self.pending);
    }
}

/// In-flight registration attempts, keyed by host name.
///
/// Exactly one attempt per host name may be in flight; a concurrent
/// duplicate observes the first attempt and fails instead of corrupting
/// shared state.
#[derive(Default)]
pub struct PendingRegistrations {
    inflight: DashMap<String, Arc<PendingRegistration>>,
}

impl PendingRegistrations {
    pub fn new() -> Self {
        PendingRegistrations::default()
    }

    /// Claim the in-flight slot for a host name.
    ///
    /// Atomic create-if-absent: the loser of a race sees the winner's
    /// attempt and fails with `HostAlreadyExists`.
    pub fn claim(
        &self,
        host: &str,
        connection: uuid::Uuid,
    ) -> DomainResult<(PendingGuard<'_>, oneshot::Receiver<CompletionSignal>)> {
        match self.inflight.entry(host.to_string()) {
            Entry::Occupied(_) => Err(DomainError::HostAlreadyExists(host.to_string())),
            Entry::Vacant(entry) => {
                let (pending, rx) = PendingRegistration::new(host, connection);
                pending.waiters.fetch_add(1, Ordering::SeqCst);
                entry.insert(pending.clone());
                Ok((
                    PendingGuard {
                        registrations: self,
                        pending,
                    },
                    rx,
                ))
            }
        }
    }

    /// Join the attempt for `host` if one is in flight on this connection.
    pub fn enter(&self, host: &str, connection: uuid::Uuid) -> Option<PendingGuard<'_>> {
        let pending = Arc::clone(self.inflight.get(host)?.value());
        if pending.connection != connection {
            return None;
        }
        pending.waiters.fetch_add(1, Ordering::SeqCst);
        Some(PendingGuard {
            registrations: self,
            pending,
        })
    }

    /// Whether any attempt is in flight for the host name.
    pub fn contains(&self, host: &str) -> bool {
        self.inflight.contains_key(host)
    }

    fn release(&self, pending: &Arc<PendingRegistration>) {
        if pending.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last party out removes the entry, and only if it is still
            // this attempt rather than a successor.
            self.inflight
                .remove_if(&pending.host_name, |_, current| {
                    Arc::ptr_eq(current, pending)
                });
        }
    }
}
