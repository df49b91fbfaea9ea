//! Inbound event loop.
//!
//! Responses resolve pending calls; requests are looked up in the dispatch
//! table and handed to an executor. The loop itself never awaits a handler
//! or a transport write, so one slow handler cannot stall other traffic.

use crate::adapters::executor::Job;
use crate::domain::command::{codes, RemotingCommand};
use crate::domain::dispatch::DispatchEntry;
use crate::domain::error::RemotingError;
use crate::ports::inbound::ProcessContext;
use crate::ports::outbound::{ConnectionHandle, TransportEvent};
use crate::service::engine::Shared;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Remark sent with `SYSTEM_BUSY` replies
const BUSY_REMARK: &str = "system busy, start flow control for a while";

pub(crate) async fn run_event_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Inbound(_, command) if command.is_response() => {
                shared.pending.complete(command);
            }
            TransportEvent::Inbound(connection, request) => {
                dispatch_request(&shared, connection, request);
            }
            TransportEvent::ConnectionLost(connection) => {
                let cause = RemotingError::ConnectionLost {
                    addr: connection.remote_addr().to_string(),
                };
                let cancelled = shared.pending.cancel_connection(&connection, cause);
                debug!(connection = %connection, cancelled = cancelled, "Connection lost");
            }
        }
    }
    debug!("Transport event stream closed");
}

fn dispatch_request(shared: &Arc<Shared>, connection: ConnectionHandle, request: RemotingCommand) {
    let Some(entry) = shared.dispatch.lookup(request.code) else {
        warn!(
            code = request.code,
            remote = %connection.remote_addr(),
            correlation_id = %request.correlation_id(),
            "Request code not supported"
        );
        let response = RemotingCommand::create_response(
            &request,
            codes::REQUEST_CODE_NOT_SUPPORTED,
            Some(format!("request code {} not supported", request.code)),
        );
        reply_detached(shared, connection, &request, response);
        return;
    };

    let executor = match entry.executor() {
        Some(executor) => Arc::clone(executor),
        None => match shared.public_executor() {
            Some(executor) => executor,
            None => {
                error!(code = request.code, "No executor available for request");
                let busy = busy_response(&request);
                reply_detached(shared, connection, &request, busy);
                return;
            }
        },
    };

    if entry.should_reject(&executor) {
        warn!(
            code = request.code,
            remote = %connection.remote_addr(),
            executor = executor.name(),
            queue_len = executor.queue_len(),
            "Rejected request, processor busy"
        );
        let busy = busy_response(&request);
        reply_detached(shared, connection, &request, busy);
        return;
    }

    // Built up front: the request moves into the job
    let busy = busy_response(&request);
    let oneway = request.is_oneway();

    let job: Job = process_request(Arc::clone(shared), entry, connection.clone(), request).boxed();
    if let Err(rejected) = executor.try_submit_job(job) {
        warn!(
            code = busy.code,
            executor = executor.name(),
            error = %rejected.error,
            "Executor refused request after admission"
        );
        if !oneway {
            send_detached(shared, connection, busy);
        }
    }
}

fn busy_response(request: &RemotingCommand) -> RemotingCommand {
    RemotingCommand::create_response(request, codes::SYSTEM_BUSY, Some(BUSY_REMARK.into()))
}

/// Send an engine-synthesized reply without blocking the event loop.
fn reply_detached(
    shared: &Arc<Shared>,
    connection: ConnectionHandle,
    request: &RemotingCommand,
    response: RemotingCommand,
) {
    if request.is_oneway() {
        debug!(
            correlation_id = %request.correlation_id(),
            code = response.code,
            "Oneway request, reply dropped"
        );
        return;
    }
    send_detached(shared, connection, response);
}

fn send_detached(shared: &Arc<Shared>, connection: ConnectionHandle, response: RemotingCommand) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        send_response(&shared, &connection, &response).await;
    });
}

async fn send_response(shared: &Shared, connection: &ConnectionHandle, response: &RemotingCommand) {
    if let Err(e) = shared.transport.send(connection, response).await {
        warn!(
            correlation_id = %response.correlation_id(),
            code = response.code,
            remote = %connection.remote_addr(),
            error = %e,
            "Failed to send response"
        );
    }
}

/// Run one handler on a worker and send back what it produced.
async fn process_request(
    shared: Arc<Shared>,
    entry: Arc<DispatchEntry>,
    connection: ConnectionHandle,
    request: RemotingCommand,
) {
    let ctx = ProcessContext { connection };
    let remote = ctx.remote_addr().to_string();
    shared.before_request(&remote, &request);

    let outcome = AssertUnwindSafe(entry.processor().process_request(&ctx, request.clone()))
        .catch_unwind()
        .await;

    let response = match outcome {
        Ok(Ok(Some(response))) => response.into_response_for(request.correlation_id()),
        Ok(Ok(None)) => {
            debug!(
                code = request.code,
                correlation_id = %request.correlation_id(),
                "Processor produced no response"
            );
            return;
        }
        Ok(Err(e)) => {
            error!(
                code = request.code,
                correlation_id = %request.correlation_id(),
                remote = %remote,
                error = %e,
                "Request processor failed"
            );
            RemotingCommand::create_response(&request, codes::SYSTEM_ERROR, Some(format!("{:#}", e)))
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            error!(
                code = request.code,
                correlation_id = %request.correlation_id(),
                remote = %remote,
                panic = %message,
                "Request processor panicked"
            );
            RemotingCommand::create_response(
                &request,
                codes::SYSTEM_ERROR,
                Some(format!("processor panicked: {}", message)),
            )
        }
    };

    if request.is_oneway() {
        debug!(
            code = request.code,
            correlation_id = %request.correlation_id(),
            "Oneway request, response discarded"
        );
        return;
    }

    shared.after_response(&remote, &request, &response);
    send_response(&shared, &ctx.connection, &response).await;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
