//! Remoting service - the invocation engine.
//!
//! Owns the pending-call table, the dispatch table, admission control and
//! the background tasks (timeout reaper and inbound event loop).

use crate::adapters::executor::WorkerPool;
use crate::domain::command::RemotingCommand;
use crate::domain::config::{RemotingConfig, MAX_INVOKE_TIMEOUT};
use crate::domain::dispatch::{default_rejection_policy, DispatchEntry, DispatchTable, RejectionPolicy};
use crate::domain::error::{RemotingError, RemotingResult};
use crate::domain::pending::{CompletionSink, InvokeOutcome, NewCall, PendingCallTable};
use crate::ports::inbound::{RequestProcessor, RpcHook};
use crate::ports::outbound::{ConnectionHandle, Transport, TransportError, TransportEvent};
use crate::service::inbound::run_event_loop;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const SHUT_DOWN: u8 = 2;

/// Lifecycle of a [`RemotingService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Created,
    Running,
    ShutDown,
}

impl ServiceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            CREATED => ServiceState::Created,
            RUNNING => ServiceState::Running,
            _ => ServiceState::ShutDown,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Created => write!(f, "not started"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::ShutDown => write!(f, "shut down"),
        }
    }
}

/// Point-in-time counters for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub state: ServiceState,
    pub pending: usize,
    pub registered: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub unmatched: u64,
    pub async_permits_available: usize,
    pub oneway_permits_available: usize,
}

/// State shared between the service handle and its background tasks.
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pending: Arc<PendingCallTable>,
    pub(crate) dispatch: DispatchTable,
    hooks: RwLock<Vec<Arc<dyn RpcHook>>>,
    public_executor: RwLock<Option<Arc<WorkerPool>>>,
}

impl Shared {
    pub(crate) fn public_executor(&self) -> Option<Arc<WorkerPool>> {
        self.public_executor.read().clone()
    }

    fn hooks(&self) -> Vec<Arc<dyn RpcHook>> {
        self.hooks.read().clone()
    }

    pub(crate) fn before_request(&self, remote_addr: &str, request: &RemotingCommand) {
        for hook in self.hooks() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                hook.do_before_request(remote_addr, request)
            }));
            if outcome.is_err() {
                error!(code = request.code, remote = remote_addr, "RPC hook panicked before request");
            }
        }
    }

    pub(crate) fn after_response(
        &self,
        remote_addr: &str,
        request: &RemotingCommand,
        response: &RemotingCommand,
    ) {
        run_after_hooks(&self.hooks(), remote_addr, request, response);
    }
}

fn run_after_hooks(
    hooks: &[Arc<dyn RpcHook>],
    remote_addr: &str,
    request: &RemotingCommand,
    response: &RemotingCommand,
) {
    for hook in hooks {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            hook.do_after_response(remote_addr, request, response)
        }));
        if outcome.is_err() {
            error!(code = request.code, remote = remote_addr, "RPC hook panicked after response");
        }
    }
}

/// Map a transport write failure onto the invocation taxonomy.
fn send_failure(addr: &str, error: TransportError) -> RemotingError {
    match error {
        TransportError::FrameTooLarge { size, max } => RemotingError::FrameTooLarge { size, max },
        TransportError::ConnectFailed(reason) => RemotingError::connect(addr, reason),
        other => RemotingError::send(addr, other),
    }
}

/// Bidirectional RPC engine over a [`Transport`].
///
/// # Usage
///
/// ```ignore
/// let network = MemoryNetwork::new(DEFAULT_MAX_FRAME_SIZE, 1024);
/// let (transport, events) = network.bind("client")?;
/// let service = RemotingService::new(RemotingConfig::default(), Arc::new(transport), events)?;
/// service.start()?;
///
/// let request = RemotingCommand::create_request(1, None).with_body("hello");
/// let response = service.invoke_sync("server", request, Some(Duration::from_secs(1))).await?;
/// ```
pub struct RemotingService {
    config: RemotingConfig,
    shared: Arc<Shared>,
    state: AtomicU8,
    async_permits: Arc<Semaphore>,
    oneway_permits: Arc<Semaphore>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Executors created by the service, shut down with it
    owned_executors: Mutex<Vec<Arc<WorkerPool>>>,
}

impl RemotingService {
    /// Create a service over `transport`, consuming its inbound `events`.
    pub fn new(
        config: RemotingConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> RemotingResult<Self> {
        config
            .validate()
            .map_err(|e| RemotingError::Config(e.to_string()))?;

        let shared = Arc::new(Shared {
            transport,
            pending: Arc::new(PendingCallTable::new()),
            dispatch: DispatchTable::new(),
            hooks: RwLock::new(Vec::new()),
            public_executor: RwLock::new(None),
        });

        Ok(Self {
            async_permits: Arc::new(Semaphore::new(config.invoke.async_permits)),
            oneway_permits: Arc::new(Semaphore::new(config.invoke.oneway_permits)),
            config,
            shared,
            state: AtomicU8::new(CREATED),
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Vec::new()),
            owned_executors: Mutex::new(Vec::new()),
        })
    }

    /// Start executors, the timeout reaper and the inbound event loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> RemotingResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| RemotingError::ServiceState("started outside a tokio runtime".into()))?;

        if let Err(current) =
            self.state
                .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(RemotingError::ServiceState(
                ServiceState::from_u8(current).to_string(),
            ));
        }

        let Some(events) = self.events.lock().take() else {
            return Err(RemotingError::ServiceState("event stream already consumed".into()));
        };

        let executors = &self.config.executors;
        let public = Arc::new(WorkerPool::new(
            "remoting-public",
            executors.public_threads,
            executors.queue_capacity,
        ));
        *self.shared.public_executor.write() = Some(Arc::clone(&public));
        self.owned_executors.lock().push(public);

        if self.shared.pending.callback_executor().is_none() {
            let callbacks = Arc::new(WorkerPool::new(
                "remoting-callback",
                executors.callback_threads,
                executors.queue_capacity,
            ));
            self.shared.pending.set_callback_executor(Arc::clone(&callbacks));
            self.owned_executors.lock().push(callbacks);
        }

        let reaper = handle.spawn(run_reaper(
            Arc::clone(&self.shared.pending),
            self.config.reaper.interval,
        ));
        let event_loop = handle.spawn(run_event_loop(Arc::clone(&self.shared), events));
        self.tasks.lock().extend([reaper, event_loop]);

        info!(
            reaper_interval_ms = self.config.reaper.interval.as_millis(),
            async_permits = self.config.invoke.async_permits,
            oneway_permits = self.config.invoke.oneway_permits,
            "Remoting service started"
        );
        Ok(())
    }

    /// Cancel every pending call with `SHUTDOWN` and stop background work.
    ///
    /// Idempotent. Also runs on drop.
    pub fn shutdown(&self) {
        if self.state.swap(SHUT_DOWN, Ordering::AcqRel) == SHUT_DOWN {
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let cancelled = self.shared.pending.cancel_all(RemotingError::Shutdown);

        // Owned pools drain what is already queued, including the callbacks
        // the cancellation above just submitted.
        for executor in self.owned_executors.lock().drain(..) {
            executor.shutdown();
        }
        self.shared.public_executor.write().take();

        info!(cancelled = cancelled, "Remoting service shut down");
    }

    /// Send `request` and wait for its response, at most `timeout`.
    ///
    /// `None` uses `invoke.default_timeout`.
    pub async fn invoke_sync(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout: Option<Duration>,
    ) -> RemotingResult<RemotingCommand> {
        self.ensure_running()?;
        let timeout = self.effective_timeout(timeout);
        self.check_frame(&request)?;
        let connection = self.resolve(addr).await?;
        let correlation_id = request.correlation_id();

        let (tx, mut rx) = oneshot::channel();
        self.shared.pending.register(NewCall {
            request: request.clone(),
            connection: connection.clone(),
            timeout,
            sink: CompletionSink::Waiter(tx),
            permit: None,
        })?;

        self.shared.before_request(addr, &request);
        if let Err(e) = self.shared.transport.send(&connection, &request).await {
            let failure = send_failure(addr, e);
            if self.shared.pending.withdraw(&correlation_id) {
                warn!(
                    correlation_id = %correlation_id,
                    addr = addr,
                    error = %failure,
                    "Sync request send failed"
                );
                return Err(failure);
            }
            // Already resolved, e.g. by a connection loss; report that instead
            return rx.await.unwrap_or(Err(RemotingError::Interrupted));
        }

        let result = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RemotingError::Interrupted),
            Err(_) => {
                // Our own timer fired before the reaper got to it. Whoever
                // wins the claim has put the result in the channel.
                self.shared.pending.timeout_one(&correlation_id);
                rx.await.unwrap_or(Err(RemotingError::Interrupted))
            }
        };

        if let Ok(response) = &result {
            self.shared.after_response(addr, &request, response);
        }
        result
    }

    /// Send `request` and return immediately; `callback` receives the outcome.
    ///
    /// Fails fast with `TOO_MANY_REQUESTS` when no admission permit is free.
    /// Connect, send and frame-size failures are returned here and never
    /// reach the callback.
    pub async fn invoke_async<F>(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout: Option<Duration>,
        callback: F,
    ) -> RemotingResult<()>
    where
        F: FnOnce(InvokeOutcome) + Send + 'static,
    {
        self.ensure_running()?;
        let timeout = self.effective_timeout(timeout);
        self.check_frame(&request)?;

        let permit = Arc::clone(&self.async_permits)
            .try_acquire_owned()
            .map_err(|_| {
                warn!(
                    code = request.code,
                    addr = addr,
                    limit = self.config.invoke.async_permits,
                    "Async admission rejected"
                );
                RemotingError::TooManyRequests(format!(
                    "{} async requests in flight",
                    self.config.invoke.async_permits
                ))
            })?;

        let connection = self.resolve(addr).await?;
        let correlation_id = request.correlation_id();

        let hooks = self.shared.hooks();
        let sink = if hooks.is_empty() {
            CompletionSink::Callback(Box::new(callback))
        } else {
            let sent = request.clone();
            CompletionSink::Callback(Box::new(move |outcome: InvokeOutcome| {
                if let Some(response) = outcome.response() {
                    run_after_hooks(&hooks, &outcome.remote_addr, &sent, response);
                }
                callback(outcome)
            }))
        };

        self.shared.pending.register(NewCall {
            request: request.clone(),
            connection: connection.clone(),
            timeout,
            sink,
            permit: Some(permit),
        })?;

        self.shared.before_request(addr, &request);
        if let Err(e) = self.shared.transport.send(&connection, &request).await {
            let failure = send_failure(addr, e);
            if self.shared.pending.withdraw(&correlation_id) {
                warn!(
                    correlation_id = %correlation_id,
                    addr = addr,
                    error = %failure,
                    "Async request send failed"
                );
                return Err(failure);
            }
            debug!(
                correlation_id = %correlation_id,
                "Send failed after call was resolved; callback has the outcome"
            );
        }
        Ok(())
    }

    /// Send `request` flagged oneway; nothing is registered or awaited.
    pub async fn invoke_oneway(&self, addr: &str, mut request: RemotingCommand) -> RemotingResult<()> {
        self.ensure_running()?;
        request.mark_oneway();
        self.check_frame(&request)?;

        // Held only for the duration of the write
        let _permit = self.oneway_permits.try_acquire().map_err(|_| {
            warn!(
                code = request.code,
                addr = addr,
                limit = self.config.invoke.oneway_permits,
                "Oneway admission rejected"
            );
            RemotingError::TooManyRequests(format!(
                "{} oneway requests in flight",
                self.config.invoke.oneway_permits
            ))
        })?;

        let connection = self.resolve(addr).await?;
        self.shared.before_request(addr, &request);
        self.shared
            .transport
            .send(&connection, &request)
            .await
            .map_err(|e| send_failure(addr, e))?;

        debug!(
            correlation_id = %request.correlation_id(),
            code = request.code,
            addr = addr,
            "Sent oneway request"
        );
        Ok(())
    }

    /// Register `processor` for `code` with the default rejection policy.
    ///
    /// Without an `executor` the processor runs on the shared public executor.
    pub fn register_processor(
        &self,
        code: i32,
        processor: Arc<dyn RequestProcessor>,
        executor: Option<Arc<WorkerPool>>,
    ) {
        self.register_processor_with_policy(code, processor, executor, default_rejection_policy());
    }

    pub fn register_processor_with_policy(
        &self,
        code: i32,
        processor: Arc<dyn RequestProcessor>,
        executor: Option<Arc<WorkerPool>>,
        policy: RejectionPolicy,
    ) {
        self.shared
            .dispatch
            .register(code, DispatchEntry::new(processor, executor, policy));
    }

    /// Processor for request codes with no explicit registration.
    pub fn register_default_processor(
        &self,
        processor: Arc<dyn RequestProcessor>,
        executor: Option<Arc<WorkerPool>>,
    ) {
        self.shared.dispatch.register_default(DispatchEntry::new(
            processor,
            executor,
            default_rejection_policy(),
        ));
    }

    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        self.shared.hooks.write().push(hook);
    }

    /// Run async callbacks on `executor` instead of the service's own pool.
    pub fn set_callback_executor(&self, executor: Arc<WorkerPool>) {
        self.shared.pending.set_callback_executor(executor);
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &RemotingConfig {
        &self.config
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.pending_count()
    }

    pub fn async_permits_available(&self) -> usize {
        self.async_permits.available_permits()
    }

    pub fn stats(&self) -> ServiceStats {
        let stats = self.shared.pending.stats();
        ServiceStats {
            state: self.state(),
            pending: self.pending_count(),
            registered: stats.total_registered.load(Ordering::Relaxed),
            completed: stats.total_completed.load(Ordering::Relaxed),
            timeouts: stats.total_timeouts.load(Ordering::Relaxed),
            cancelled: stats.total_cancelled.load(Ordering::Relaxed),
            unmatched: stats.total_unmatched.load(Ordering::Relaxed),
            async_permits_available: self.async_permits.available_permits(),
            oneway_permits_available: self.oneway_permits.available_permits(),
        }
    }

    fn ensure_running(&self) -> RemotingResult<()> {
        match self.state() {
            ServiceState::Running => Ok(()),
            other => Err(RemotingError::ServiceState(other.to_string())),
        }
    }

    /// Caller timeout, or the configured default, capped at [`MAX_INVOKE_TIMEOUT`].
    fn effective_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout
            .unwrap_or(self.config.invoke.default_timeout)
            .min(MAX_INVOKE_TIMEOUT)
    }

    fn check_frame(&self, request: &RemotingCommand) -> RemotingResult<()> {
        let size = request.encoded_len();
        let max = self.config.invoke.max_frame_size;
        if size > max {
            warn!(
                correlation_id = %request.correlation_id(),
                code = request.code,
                size = size,
                max = max,
                "Request exceeds maximum frame size"
            );
            return Err(RemotingError::FrameTooLarge { size, max });
        }
        Ok(())
    }

    async fn resolve(&self, addr: &str) -> RemotingResult<ConnectionHandle> {
        self.shared
            .transport
            .resolve_connection(addr)
            .await
            .map_err(|e| {
                warn!(addr = addr, error = %e, "Failed to resolve connection");
                RemotingError::connect(addr, e)
            })
    }
}

impl Drop for RemotingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Time out expired calls on a fixed interval.
async fn run_reaper(pending: Arc<PendingCallTable>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let expired = pending.expire_older_than(Instant::now());
        if expired > 0 {
            debug!(expired = expired, "Reaper expired pending calls");
        }
    }
}
