//! Pending-call table: correlation ID -> outstanding call.
//!
//! Every record starts in `Waiting` and leaves it exactly once. Completion,
//! timeout and cancellation all race through the same compare-and-set on the
//! record's state; only the winner removes the record, releases its admission
//! permit and delivers the result.
//!
//! ```text
//!                 ┌────────────┐
//!         ┌──────►│ COMPLETED  │  response arrived
//!         │       └────────────┘
//! ┌───────┴──┐    ┌────────────┐
//! │ WAITING  ├───►│ TIMED_OUT  │  reaper / sync waiter deadline
//! └───────┬──┘    └────────────┘
//!         │       ┌────────────┐
//!         └──────►│ CANCELLED  │  connection lost, send failed, shutdown
//!                 └────────────┘
//! ```

use crate::adapters::executor::{Job, WorkerPool};
use crate::domain::command::RemotingCommand;
use crate::domain::config::MAX_INVOKE_TIMEOUT;
use crate::domain::correlation::CorrelationId;
use crate::domain::error::{RemotingError, RemotingResult};
use crate::ports::outbound::ConnectionHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tracing::{debug, error, warn};

const WAITING: u8 = 0;
const COMPLETED: u8 = 1;
const TIMED_OUT: u8 = 2;
const CANCELLED: u8 = 3;

/// Lifecycle state of a pending call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Waiting,
    Completed,
    TimedOut,
    Cancelled,
}

impl CallState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            COMPLETED => CallState::Completed,
            TIMED_OUT => CallState::TimedOut,
            CANCELLED => CallState::Cancelled,
            _ => CallState::Waiting,
        }
    }
}

/// Result handed to an async callback.
#[derive(Debug)]
pub struct InvokeOutcome {
    pub correlation_id: CorrelationId,
    /// Code of the request that was sent
    pub request_code: i32,
    pub remote_addr: String,
    /// Time from registration to resolution
    pub elapsed: Duration,
    pub result: RemotingResult<RemotingCommand>,
}

impl InvokeOutcome {
    /// The response command, if the call completed
    pub fn response(&self) -> Option<&RemotingCommand> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RemotingError> {
        self.result.as_ref().err()
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Callback for async invocations, run at most once on the callback executor.
pub type InvokeCallback = Box<dyn FnOnce(InvokeOutcome) + Send + 'static>;

/// Where a pending call's single result goes
pub enum CompletionSink {
    /// Blocked sync caller
    Waiter(oneshot::Sender<RemotingResult<RemotingCommand>>),
    /// Async callback
    Callback(InvokeCallback),
}

/// Bookkeeping for one outstanding invocation.
pub struct PendingCall {
    correlation_id: CorrelationId,
    request: RemotingCommand,
    connection: ConnectionHandle,
    created_at: Instant,
    deadline: Instant,
    timeout: Duration,
    state: AtomicU8,
    sink: Mutex<Option<CompletionSink>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl PendingCall {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move WAITING -> `target`. Exactly one caller ever succeeds.
    fn claim(&self, target: u8) -> bool {
        self.state
            .compare_exchange(WAITING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Statistics for the pending-call table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total calls registered
    pub total_registered: AtomicU64,
    /// Total calls completed by a response
    pub total_completed: AtomicU64,
    /// Total calls timed out
    pub total_timeouts: AtomicU64,
    /// Total calls cancelled
    pub total_cancelled: AtomicU64,
    /// Responses that matched no pending call
    pub total_unmatched: AtomicU64,
}

/// Registration parameters for [`PendingCallTable::register`]
pub struct NewCall {
    pub request: RemotingCommand,
    pub connection: ConnectionHandle,
    pub timeout: Duration,
    pub sink: CompletionSink,
    /// Async admission permit, released at resolution
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Pending-call table shared by callers, the inbound loop and the reaper.
pub struct PendingCallTable {
    pending: DashMap<CorrelationId, Arc<PendingCall>>,
    callback_executor: RwLock<Option<Arc<WorkerPool>>>,
    stats: PendingStats,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            callback_executor: RwLock::new(None),
            stats: PendingStats::default(),
        }
    }

    /// Executor async callbacks run on
    pub fn set_callback_executor(&self, executor: Arc<WorkerPool>) {
        *self.callback_executor.write() = Some(executor);
    }

    pub fn callback_executor(&self) -> Option<Arc<WorkerPool>> {
        self.callback_executor.read().clone()
    }

    /// Register an outstanding call keyed by its request's correlation ID.
    pub fn register(&self, call: NewCall) -> RemotingResult<Arc<PendingCall>> {
        let correlation_id = call.request.correlation_id();
        let now = Instant::now();
        let record = Arc::new(PendingCall {
            correlation_id,
            request: call.request,
            connection: call.connection,
            created_at: now,
            deadline: now
                .checked_add(call.timeout)
                .unwrap_or_else(|| now + MAX_INVOKE_TIMEOUT),
            timeout: call.timeout,
            state: AtomicU8::new(WAITING),
            sink: Mutex::new(Some(call.sink)),
            permit: Mutex::new(call.permit),
        });

        match self.pending.entry(correlation_id) {
            Entry::Occupied(_) => {
                error!(
                    correlation_id = %correlation_id,
                    "Correlation ID already pending; request command reused while in flight"
                );
                Err(RemotingError::DuplicateCorrelation(correlation_id))
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&record));
                self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %correlation_id,
                    code = record.request.code,
                    remote = %record.connection.remote_addr(),
                    timeout_ms = call.timeout.as_millis(),
                    "Registered pending call"
                );
                Ok(record)
            }
        }
    }

    /// Resolve the call matching `response`.
    ///
    /// Returns false for late, duplicate or unknown responses.
    pub fn complete(&self, response: RemotingCommand) -> bool {
        let correlation_id = response.correlation_id();
        let Some(call) = self.get(&correlation_id) else {
            self.stats.total_unmatched.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %correlation_id,
                code = response.code,
                "Response for unknown or expired correlation ID"
            );
            return false;
        };

        if !call.claim(COMPLETED) {
            self.stats.total_unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                state = ?call.state(),
                "Response lost race to another resolution"
            );
            return false;
        }

        self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            correlation_id = %correlation_id,
            code = response.code,
            response_time_ms = call.created_at.elapsed().as_millis(),
            "Completed pending call"
        );
        self.resolve(&call, Ok(response));
        true
    }

    /// Time out every waiting call whose deadline is at or before `now`.
    ///
    /// Returns the number of calls this scan resolved.
    pub fn expire_older_than(&self, now: Instant) -> usize {
        // Collect first: resolving removes entries, which must not happen
        // while iteration holds shard locks.
        let expired: Vec<Arc<PendingCall>> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        expired
            .into_iter()
            .filter(|call| self.try_time_out(call))
            .count()
    }

    /// Time out one call, e.g. when a sync waiter's own timer fires first.
    pub fn timeout_one(&self, correlation_id: &CorrelationId) -> bool {
        self.get(correlation_id)
            .is_some_and(|call| self.try_time_out(&call))
    }

    /// Cancel one call with `cause`.
    pub fn cancel_one(&self, correlation_id: &CorrelationId, cause: RemotingError) -> bool {
        self.get(correlation_id)
            .is_some_and(|call| self.try_cancel(&call, cause))
    }

    /// Remove a call whose send failed without delivering anything to its sink.
    ///
    /// The caller reports the failure directly. Returns false when another
    /// resolution already won, in which case the sink has the result.
    pub fn withdraw(&self, correlation_id: &CorrelationId) -> bool {
        let Some(call) = self.get(correlation_id) else {
            return false;
        };
        if !call.claim(CANCELLED) {
            return false;
        }
        self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
        self.pending
            .remove_if(correlation_id, |_, current| Arc::ptr_eq(current, &call));
        drop(call.permit.lock().take());
        drop(call.sink.lock().take());
        debug!(correlation_id = %correlation_id, "Withdrew pending call after failed send");
        true
    }

    /// Cancel every waiting call sent on `connection`.
    pub fn cancel_connection(&self, connection: &ConnectionHandle, cause: RemotingError) -> usize {
        let affected: Vec<Arc<PendingCall>> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection.id() == connection.id())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let cancelled = affected
            .into_iter()
            .filter(|call| self.try_cancel(call, cause.clone()))
            .count();

        if cancelled > 0 {
            warn!(
                connection = %connection,
                cancelled = cancelled,
                cause = %cause,
                "Cancelled pending calls on connection"
            );
        }
        cancelled
    }

    /// Cancel every waiting call.
    pub fn cancel_all(&self, cause: RemotingError) -> usize {
        let all: Vec<Arc<PendingCall>> = self
            .pending
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        all.into_iter()
            .filter(|call| self.try_cancel(call, cause.clone()))
            .count()
    }

    /// Get number of currently pending calls
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a correlation ID is pending
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Get statistics
    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    fn get(&self, correlation_id: &CorrelationId) -> Option<Arc<PendingCall>> {
        self.pending
            .get(correlation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn try_time_out(&self, call: &Arc<PendingCall>) -> bool {
        if !call.claim(TIMED_OUT) {
            return false;
        }
        self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(
            correlation_id = %call.correlation_id,
            code = call.request.code,
            remote = %call.connection.remote_addr(),
            timeout_ms = call.timeout.as_millis(),
            "Pending call timed out"
        );
        let cause = RemotingError::timeout(call.connection.remote_addr(), call.timeout);
        self.resolve(call, Err(cause));
        true
    }

    fn try_cancel(&self, call: &Arc<PendingCall>, cause: RemotingError) -> bool {
        if !call.claim(CANCELLED) {
            return false;
        }
        self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(
            correlation_id = %call.correlation_id,
            cause = %cause,
            "Cancelled pending call"
        );
        self.resolve(call, Err(cause));
        true
    }

    /// Deliver the result. Only the claim winner gets here.
    fn resolve(&self, call: &Arc<PendingCall>, result: RemotingResult<RemotingCommand>) {
        self.pending
            .remove_if(&call.correlation_id, |_, current| Arc::ptr_eq(current, call));

        // Capacity is free before user code observes the result
        drop(call.permit.lock().take());

        let Some(sink) = call.sink.lock().take() else {
            return;
        };
        match sink {
            CompletionSink::Waiter(tx) => {
                if tx.send(result).is_err() {
                    debug!(
                        correlation_id = %call.correlation_id,
                        "Sync waiter already gone"
                    );
                }
            }
            CompletionSink::Callback(callback) => {
                let outcome = InvokeOutcome {
                    correlation_id: call.correlation_id,
                    request_code: call.request.code,
                    remote_addr: call.connection.remote_addr().to_string(),
                    elapsed: call.created_at.elapsed(),
                    result,
                };
                self.submit_callback(callback, outcome);
            }
        }
    }

    fn submit_callback(&self, callback: InvokeCallback, outcome: InvokeOutcome) {
        let correlation_id = outcome.correlation_id;
        let job: Job = async move {
            if std::panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
                error!(correlation_id = %correlation_id, "Invoke callback panicked");
            }
        }
        .boxed();

        let job = match self.callback_executor() {
            Some(executor) => match executor.try_submit_job(job) {
                Ok(()) => return,
                Err(rejected) => {
                    warn!(
                        correlation_id = %correlation_id,
                        executor = executor.name(),
                        error = %rejected.error,
                        "Callback executor refused job, running on a detached task"
                    );
                    rejected.job
                }
            },
            None => job,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(job);
            }
            Err(_) => {
                error!(correlation_id = %correlation_id, "No runtime to run invoke callback");
            }
        }
    }
}

impl Default for PendingCallTable {
    fn default() -> Self {
        Self::new()
    }
}
