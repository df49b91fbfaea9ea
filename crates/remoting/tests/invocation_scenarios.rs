//! # Invocation Scenarios
//!
//! End-to-end tests over the in-memory transport: two engines (or one engine
//! and a silent peer that never answers) exchanging real encoded frames.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use remoting::{
    codes, ConnectionHandle, ErrorKind, InvokeOutcome, MemoryNetwork, ProcessContext,
    RejectionPolicy, RemotingCommand, RemotingConfig, RemotingError, RemotingService,
    RequestProcessor, RpcHook, ServiceState, Transport, TransportError, TransportEvent, WorkerPool,
};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::{sleep, timeout};

const ECHO: i32 = 1;

// =============================================================================
// Fixtures
// =============================================================================

struct EchoProcessor;

#[async_trait]
impl RequestProcessor for EchoProcessor {
    async fn process_request(
        &self,
        _ctx: &ProcessContext,
        mut request: RemotingCommand,
    ) -> anyhow::Result<Option<RemotingCommand>> {
        request.mark_response();
        Ok(Some(request))
    }
}

struct TaggedProcessor(&'static str);

#[async_trait]
impl RequestProcessor for TaggedProcessor {
    async fn process_request(
        &self,
        _ctx: &ProcessContext,
        request: RemotingCommand,
    ) -> anyhow::Result<Option<RemotingCommand>> {
        Ok(Some(RemotingCommand::success(&request, Some(self.0.into()))))
    }
}

struct FailingProcessor;

#[async_trait]
impl RequestProcessor for FailingProcessor {
    async fn process_request(
        &self,
        _ctx: &ProcessContext,
        _request: RemotingCommand,
    ) -> anyhow::Result<Option<RemotingCommand>> {
        anyhow::bail!("disk full")
    }
}

struct PanickingProcessor;

#[async_trait]
impl RequestProcessor for PanickingProcessor {
    async fn process_request(
        &self,
        _ctx: &ProcessContext,
        _request: RemotingCommand,
    ) -> anyhow::Result<Option<RemotingCommand>> {
        panic!("boom")
    }
}

struct BusyProcessor;

#[async_trait]
impl RequestProcessor for BusyProcessor {
    async fn process_request(
        &self,
        _ctx: &ProcessContext,
        request: RemotingCommand,
    ) -> anyhow::Result<Option<RemotingCommand>> {
        Ok(Some(RemotingCommand::success(&request, None)))
    }

    fn reject_request(&self) -> bool {
        true
    }
}

/// Forwards every request it sees and answers SUCCESS
struct RecordingProcessor(mpsc::UnboundedSender<RemotingCommand>);

#[async_trait]
impl RequestProcessor for RecordingProcessor {
    async fn process_request(
        &self,
        _ctx: &ProcessContext,
        request: RemotingCommand,
    ) -> anyhow::Result<Option<RemotingCommand>> {
        let _ = self.0.send(request.clone());
        Ok(Some(RemotingCommand::success(&request, None)))
    }
}

#[derive(Default)]
struct CountingHook {
    before: AtomicUsize,
    after: AtomicUsize,
}

impl RpcHook for CountingHook {
    fn do_before_request(&self, _remote_addr: &str, _request: &RemotingCommand) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    fn do_after_response(
        &self,
        _remote_addr: &str,
        _request: &RemotingCommand,
        _response: &RemotingCommand,
    ) {
        self.after.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport whose writes wait until the gate is opened
struct GatedTransport {
    gate: Semaphore,
    entered: Notify,
    sent: AtomicUsize,
}

impl GatedTransport {
    fn closed() -> Self {
        Self {
            gate: Semaphore::new(0),
            entered: Notify::new(),
            sent: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn resolve_connection(&self, addr: &str) -> Result<ConnectionHandle, TransportError> {
        Ok(ConnectionHandle::new(addr))
    }

    async fn send(
        &self,
        _connection: &ConnectionHandle,
        _command: &RemotingCommand,
    ) -> Result<(), TransportError> {
        self.entered.notify_one();
        let _pass = self
            .gate
            .acquire()
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_config() -> RemotingConfig {
    let mut config = RemotingConfig::default();
    config.reaper.interval = Duration::from_millis(20);
    config
}

fn started(network: &MemoryNetwork, addr: &str, config: RemotingConfig) -> RemotingService {
    let (transport, events) = network.bind(addr).unwrap();
    let service = RemotingService::new(config, Arc::new(transport), events).unwrap();
    service.start().unwrap();
    service
}

/// Client and server engines on one network
fn pair(config: RemotingConfig) -> (MemoryNetwork, RemotingService, RemotingService) {
    let network = MemoryNetwork::from_config(&config);
    let server = started(&network, "server", config.clone());
    let client = started(&network, "client", config);
    (network, client, server)
}

fn outcome_channel() -> (
    impl FnOnce(InvokeOutcome) + Send + 'static,
    mpsc::UnboundedReceiver<InvokeOutcome>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |outcome: InvokeOutcome| {
            let _ = tx.send(outcome);
        },
        rx,
    )
}

async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<InvokeOutcome>) -> InvokeOutcome {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("callback within 2s")
        .expect("callback delivered")
}

// =============================================================================
// Sync invocation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_echo_hello_world() {
    let (_network, client, server) = pair(fast_config());
    server.register_processor(ECHO, Arc::new(EchoProcessor), None);

    let request = RemotingCommand::create_request(ECHO, None).with_body("hello world");
    let id = request.correlation_id();
    let response = client
        .invoke_sync("server", request, Some(Duration::from_millis(1000)))
        .await
        .unwrap();

    assert!(response.is_response());
    assert_eq!(response.correlation_id(), id);
    assert_eq!(response.body.as_deref(), Some(&b"hello world"[..]));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsupported_code_returns_result_code() {
    let (_network, client, server) = pair(fast_config());
    server.register_processor(ECHO, Arc::new(EchoProcessor), None);

    let begin = Instant::now();
    let response = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(2, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    assert_eq!(response.code, codes::REQUEST_CODE_NOT_SUPPORTED);
    assert!(response.remark.as_deref().unwrap_or_default().contains('2'));
    assert!(begin.elapsed() < Duration::from_millis(1000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_against_silent_peer_times_out() {
    let network = MemoryNetwork::from_config(&fast_config());
    let _silent = network.bind("silent").unwrap();
    let client = started(&network, "client", fast_config());

    let bound = Duration::from_millis(200);
    let begin = Instant::now();
    let err = client
        .invoke_sync("silent", RemotingCommand::create_request(ECHO, None), Some(bound))
        .await
        .unwrap_err();
    let elapsed = begin.elapsed();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(elapsed >= bound, "returned early after {:?}", elapsed);
    assert!(elapsed < bound + Duration::from_millis(500), "took {:?}", elapsed);
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.stats().timeouts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_too_large_fails_before_send() {
    let mut config = fast_config();
    config.invoke.max_frame_size = 1024;
    let network = MemoryNetwork::from_config(&config);
    let (_silent, mut silent_rx) = network.bind("silent").unwrap();
    let client = started(&network, "client", config);

    let request = RemotingCommand::create_request(ECHO, None).with_body(vec![7u8; 4096]);
    let err = client
        .invoke_sync("silent", request, Some(Duration::from_millis(500)))
        .await
        .unwrap_err();

    assert!(matches!(err, RemotingError::FrameTooLarge { max: 1024, .. }));
    assert_eq!(client.pending_count(), 0);
    assert!(silent_rx.try_recv().is_err());
}

// =============================================================================
// Async invocation and admission control
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_echo_delivers_to_callback() {
    let (_network, client, server) = pair(fast_config());
    server.register_processor(ECHO, Arc::new(EchoProcessor), None);

    let (callback, mut rx) = outcome_channel();
    let request = RemotingCommand::create_request(ECHO, None).with_body("async");
    let id = request.correlation_id();
    client
        .invoke_async("server", request, Some(Duration::from_millis(1000)), callback)
        .await
        .unwrap();

    let outcome = next_outcome(&mut rx).await;
    assert!(outcome.is_ok());
    assert_eq!(outcome.correlation_id, id);
    assert_eq!(outcome.request_code, ECHO);
    assert_eq!(outcome.remote_addr, "server");
    assert_eq!(outcome.response().unwrap().body.as_deref(), Some(&b"async"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_limit_rejects_second_call_without_sending() {
    let mut config = fast_config();
    config.invoke.async_permits = 1;
    let network = MemoryNetwork::from_config(&config);
    let (_silent, mut silent_rx) = network.bind("silent").unwrap();
    let client = started(&network, "client", config);

    let (first, _first_rx) = outcome_channel();
    client
        .invoke_async(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_secs(10)),
            first,
        )
        .await
        .unwrap();
    assert!(matches!(silent_rx.recv().await, Some(TransportEvent::Inbound(..))));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let err = client
        .invoke_async(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_secs(10)),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TooManyRequests);
    assert!(silent_rx.try_recv().is_err(), "rejected call must not be sent");
    assert_eq!(client.async_permits_available(), 0);
    assert_eq!(client.pending_count(), 1);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permit_released_after_success() {
    let mut config = fast_config();
    config.invoke.async_permits = 1;
    let (_network, client, server) = pair(config);
    server.register_processor(ECHO, Arc::new(EchoProcessor), None);

    for _ in 0..3 {
        let (callback, mut rx) = outcome_channel();
        client
            .invoke_async(
                "server",
                RemotingCommand::create_request(ECHO, None),
                Some(Duration::from_millis(1000)),
                callback,
            )
            .await
            .unwrap();
        assert!(next_outcome(&mut rx).await.is_ok());
        assert_eq!(client.async_permits_available(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permit_released_after_timeout() {
    let mut config = fast_config();
    config.invoke.async_permits = 1;
    let network = MemoryNetwork::from_config(&config);
    let _silent = network.bind("silent").unwrap();
    let client = started(&network, "client", config);

    let (callback, mut rx) = outcome_channel();
    client
        .invoke_async(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_millis(100)),
            callback,
        )
        .await
        .unwrap();

    let outcome = next_outcome(&mut rx).await;
    assert_eq!(outcome.error().map(RemotingError::kind), Some(ErrorKind::Timeout));
    assert!(outcome.elapsed >= Duration::from_millis(100));
    assert_eq!(client.async_permits_available(), 1);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_drop_cancels_async_call_once() {
    let mut config = fast_config();
    config.invoke.async_permits = 4;
    let network = MemoryNetwork::from_config(&config);
    let (_silent, mut silent_rx) = network.bind("silent").unwrap();
    let client = started(&network, "client", config);

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deliveries);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .invoke_async(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_secs(10)),
            move |outcome: InvokeOutcome| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(outcome);
            },
        )
        .await
        .unwrap();

    let connection = match silent_rx.recv().await {
        Some(TransportEvent::Inbound(connection, _)) => connection,
        other => panic!("expected request, got {:?}", other),
    };
    assert!(network.disconnect(&connection));

    let outcome = next_outcome(&mut rx).await;
    assert_eq!(
        outcome.error().map(RemotingError::kind),
        Some(ErrorKind::ConnectionLost)
    );

    sleep(Duration::from_millis(100)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(client.async_permits_available(), 4);
    assert_eq!(client.stats().cancelled, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_send_failure_is_returned_not_called_back() {
    let mut config = fast_config();
    config.transport.outbound_buffer = 1;
    config.invoke.async_permits = 2;
    let network = MemoryNetwork::from_config(&config);
    let _silent = network.bind("silent").unwrap();
    let client = started(&network, "client", config);

    // Fills the silent peer's only inbound slot
    let (first, _first_rx) = outcome_channel();
    client
        .invoke_async(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_secs(10)),
            first,
        )
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let err = client
        .invoke_async(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_secs(10)),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Send);
    assert_eq!(client.async_permits_available(), 1);
    assert_eq!(client.pending_count(), 1);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_send_failure_leaves_nothing_pending() {
    let mut config = fast_config();
    config.transport.outbound_buffer = 1;
    let network = MemoryNetwork::from_config(&config);
    let _silent = network.bind("silent").unwrap();
    let client = started(&network, "client", config);

    client
        .invoke_oneway("silent", RemotingCommand::create_request(ECHO, None))
        .await
        .unwrap();

    let err = client
        .invoke_sync(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_secs(10)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Send);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_default_timeout_applies() {
    let mut config = fast_config();
    config.invoke.default_timeout = Duration::from_millis(150);
    let network = MemoryNetwork::from_config(&config);
    let _silent = network.bind("silent").unwrap();
    let client = started(&network, "client", config);

    let begin = Instant::now();
    let err = client
        .invoke_sync("silent", RemotingCommand::create_request(ECHO, None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RemotingError::Timeout { timeout_ms: 150, .. }));
    assert!(begin.elapsed() >= Duration::from_millis(150));

    let (callback, mut rx) = outcome_channel();
    client
        .invoke_async("silent", RemotingCommand::create_request(ECHO, None), None, callback)
        .await
        .unwrap();
    let outcome = next_outcome(&mut rx).await;
    assert!(matches!(
        outcome.error(),
        Some(RemotingError::Timeout { timeout_ms: 150, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unbounded_timeouts_wait_without_panicking() {
    let network = MemoryNetwork::from_config(&fast_config());
    let _silent = network.bind("silent").unwrap();
    let client = Arc::new(started(&network, "client", fast_config()));

    let (callback, mut rx) = outcome_channel();
    client
        .invoke_async(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::MAX),
            callback,
        )
        .await
        .unwrap();

    let waiter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .invoke_sync(
                    "silent",
                    RemotingCommand::create_request(ECHO, None),
                    Some(Duration::MAX),
                )
                .await
        })
    };

    sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    assert_eq!(client.pending_count(), 2);

    client.shutdown();
    assert_eq!(waiter.await.unwrap(), Err(RemotingError::Shutdown));
    assert_eq!(next_outcome(&mut rx).await.error(), Some(&RemotingError::Shutdown));
}

// =============================================================================
// Oneway admission
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oneway_admission_fails_fast_when_exhausted() {
    let mut config = fast_config();
    config.invoke.oneway_permits = 1;
    let transport = Arc::new(GatedTransport::closed());
    let (_events_tx, events) = mpsc::channel(16);
    let client = Arc::new(RemotingService::new(config, transport.clone(), events).unwrap());
    client.start().unwrap();

    let parked = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .invoke_oneway("peer", RemotingCommand::create_request(ECHO, None))
                .await
        })
    };
    timeout(Duration::from_secs(2), transport.entered.notified())
        .await
        .expect("first write reaches the transport");
    assert_eq!(client.stats().oneway_permits_available, 0);

    let err = client
        .invoke_oneway("peer", RemotingCommand::create_request(ECHO, None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManyRequests);
    assert_eq!(transport.sent.load(Ordering::SeqCst), 0);

    transport.gate.add_permits(1);
    parked.await.unwrap().unwrap();
    assert_eq!(client.stats().oneway_permits_available, 1);

    client
        .invoke_oneway("peer", RemotingCommand::create_request(ECHO, None))
        .await
        .unwrap();
    assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oneway_send_failure_releases_permit() {
    let mut config = fast_config();
    config.transport.outbound_buffer = 1;
    config.invoke.oneway_permits = 1;
    let network = MemoryNetwork::from_config(&config);
    let _silent = network.bind("silent").unwrap();
    let client = started(&network, "client", config);

    client
        .invoke_oneway("silent", RemotingCommand::create_request(ECHO, None))
        .await
        .unwrap();

    let err = client
        .invoke_oneway("silent", RemotingCommand::create_request(ECHO, None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Send);
    assert_eq!(client.stats().oneway_permits_available, 1);
}

// =============================================================================
// Inbound dispatch
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_processor_gets_system_busy() {
    let (_network, client, server) = pair(fast_config());
    server.register_processor(ECHO, Arc::new(BusyProcessor), None);

    let response = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    assert_eq!(response.code, codes::SYSTEM_BUSY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_custom_rejection_policy() {
    let (_network, client, server) = pair(fast_config());
    let always: RejectionPolicy = Arc::new(|_: &dyn RequestProcessor, _: &WorkerPool| true);
    server.register_processor_with_policy(ECHO, Arc::new(EchoProcessor), None, always);

    let response = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    assert_eq!(response.code, codes::SYSTEM_BUSY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_error_and_panic_become_system_error() {
    let (_network, client, server) = pair(fast_config());
    server.register_processor(10, Arc::new(FailingProcessor), None);
    server.register_processor(11, Arc::new(PanickingProcessor), None);
    server.register_processor(ECHO, Arc::new(EchoProcessor), None);

    let failed = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(10, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();
    assert_eq!(failed.code, codes::SYSTEM_ERROR);
    assert!(failed.remark.as_deref().unwrap_or_default().contains("disk full"));

    let panicked = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(11, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();
    assert_eq!(panicked.code, codes::SYSTEM_ERROR);
    assert!(panicked.remark.as_deref().unwrap_or_default().contains("boom"));

    // Same connection still serves requests
    let echoed = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(ECHO, None).with_body("still here"),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();
    assert_eq!(echoed.body.as_deref(), Some(&b"still here"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oneway_discards_handler_result() {
    let (_network, client, server) = pair(fast_config());
    let (tx, mut seen) = mpsc::unbounded_channel();
    server.register_processor(ECHO, Arc::new(RecordingProcessor(tx)), None);

    client
        .invoke_oneway("server", RemotingCommand::create_request(ECHO, None).with_body("fire"))
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(1), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(received.is_oneway());
    assert_eq!(received.body.as_deref(), Some(&b"fire"[..]));

    sleep(Duration::from_millis(100)).await;
    let stats = client.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.registered, 0);
    assert_eq!(stats.unmatched, 0, "server must not answer a oneway request");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oneway_to_unsupported_code_gets_no_reply() {
    let (_network, client, _server) = pair(fast_config());

    client
        .invoke_oneway("server", RemotingCommand::create_request(42, None))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.stats().unmatched, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reregistration_replaces_processor() {
    let (_network, client, server) = pair(fast_config());
    server.register_processor(ECHO, Arc::new(TaggedProcessor("old")), None);

    let first = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();
    assert_eq!(first.body.as_deref(), Some(&b"old"[..]));

    server.register_processor(ECHO, Arc::new(TaggedProcessor("new")), None);
    let second = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();
    assert_eq!(second.body.as_deref(), Some(&b"new"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_processor_handles_unknown_codes() {
    let (_network, client, server) = pair(fast_config());
    server.register_processor(ECHO, Arc::new(TaggedProcessor("explicit")), None);
    server.register_default_processor(Arc::new(TaggedProcessor("fallback")), None);

    let explicit = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();
    let fallback = client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(77, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    assert_eq!(explicit.body.as_deref(), Some(&b"explicit"[..]));
    assert_eq!(fallback.body.as_deref(), Some(&b"fallback"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dedicated_executor_runs_processor() {
    let (_network, client, server) = pair(fast_config());
    let executor = Arc::new(WorkerPool::new("echo-pool", 2, 16));
    server.register_processor(ECHO, Arc::new(EchoProcessor), Some(Arc::clone(&executor)));

    client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    assert_eq!(executor.stats().submitted.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rpc_hooks_observe_both_sides() {
    let (_network, client, server) = pair(fast_config());
    server.register_processor(ECHO, Arc::new(EchoProcessor), None);
    let client_hook = Arc::new(CountingHook::default());
    let server_hook = Arc::new(CountingHook::default());
    client.register_rpc_hook(client_hook.clone());
    server.register_rpc_hook(server_hook.clone());

    client
        .invoke_sync(
            "server",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    assert_eq!(client_hook.before.load(Ordering::SeqCst), 1);
    assert_eq!(client_hook.after.load(Ordering::SeqCst), 1);
    assert_eq!(server_hook.before.load(Ordering::SeqCst), 1);
    assert_eq!(server_hook.after.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_cancels_pending_calls() {
    let network = MemoryNetwork::from_config(&fast_config());
    let _silent = network.bind("silent").unwrap();
    let client = Arc::new(started(&network, "client", fast_config()));

    let (callback, mut rx) = outcome_channel();
    client
        .invoke_async(
            "silent",
            RemotingCommand::create_request(ECHO, None),
            Some(Duration::from_secs(10)),
            callback,
        )
        .await
        .unwrap();

    let waiter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .invoke_sync(
                    "silent",
                    RemotingCommand::create_request(ECHO, None),
                    Some(Duration::from_secs(10)),
                )
                .await
        })
    };
    sleep(Duration::from_millis(50)).await;
    assert_eq!(client.pending_count(), 2);

    client.shutdown();

    assert_eq!(waiter.await.unwrap(), Err(RemotingError::Shutdown));
    let outcome = next_outcome(&mut rx).await;
    assert_eq!(outcome.error(), Some(&RemotingError::Shutdown));
    assert_eq!(client.state(), ServiceState::ShutDown);
    assert_eq!(client.pending_count(), 0);
}

// =============================================================================
// Properties
// =============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn response_preserves_correlation_id(
            code in 1i32..10_000,
            body in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            let (id, response) = runtime.block_on(async {
                let (_network, client, server) = pair(fast_config());
                server.register_default_processor(Arc::new(EchoProcessor), None);

                let request = RemotingCommand::create_request(code, None).with_body(body.clone());
                let id = request.correlation_id();
                let response = client
                    .invoke_sync("server", request, Some(Duration::from_millis(1000)))
                    .await
                    .unwrap();
                (id, response)
            });

            prop_assert_eq!(response.correlation_id(), id);
            prop_assert!(response.is_response());
            prop_assert_eq!(response.body_len(), body.len());
        }
    }
}
