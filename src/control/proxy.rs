//! Control-side proxy for one execution process connection.
//!
//! Correlates requests with responses by `request_id`, forwards pushes to
//! registered callbacks, and reports registration and channel loss to the
//! supervisor. Every received envelope counts as liveness.

use super::registry::HeartbeatClock;
use super::supervisor::SupervisorEvent;
use crate::error::IpcError;
use crate::ipc::{
    ChannelReceiver, ChannelSender, ControlRequest, Envelope, MessageType, RegisterInfo,
    ResponseBody,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receives every push envelope (`account`, `position`, `order`, ...).
pub type PushCallback = Arc<dyn Fn(&str, &Envelope) + Send + Sync>;

type PendingMap = HashMap<String, oneshot::Sender<Result<ResponseBody, IpcError>>>;

struct ProxyInner {
    account_id: String,
    generation: u64,
    sender: ChannelSender,
    pending: Mutex<PendingMap>,
    callbacks: Mutex<Vec<PushCallback>>,
    heartbeat: HeartbeatClock,
    request_timeout: Duration,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

/// Cheap-to-clone handle to one live connection.
#[derive(Clone)]
pub struct ExecutionProxy {
    inner: Arc<ProxyInner>,
}

impl ExecutionProxy {
    pub fn new(
        account_id: &str,
        generation: u64,
        sender: ChannelSender,
        heartbeat: HeartbeatClock,
        request_timeout: Duration,
    ) -> Self {
        Self::build(account_id, generation, sender, heartbeat, request_timeout, None)
    }

    /// A proxy that reports `register` and channel loss to the supervisor.
    pub fn supervised(
        account_id: &str,
        generation: u64,
        sender: ChannelSender,
        heartbeat: HeartbeatClock,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self::build(
            account_id,
            generation,
            sender,
            heartbeat,
            request_timeout,
            Some(events),
        )
    }

    fn build(
        account_id: &str,
        generation: u64,
        sender: ChannelSender,
        heartbeat: HeartbeatClock,
        request_timeout: Duration,
        events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                account_id: account_id.to_string(),
                generation,
                sender,
                pending: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(Vec::new()),
                heartbeat,
                request_timeout,
                events,
            }),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Register a callback for pushed telemetry.
    pub fn on_push(&self, callback: PushCallback) {
        lock(&self.inner.callbacks).push(callback);
    }

    /// Time of the most recent envelope from the execution process.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.inner.heartbeat.last()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.is_closed()
    }

    /// Close the channel and fail every waiting caller with `ChannelClosed`.
    pub fn close(&self) {
        self.inner.sender.close();
        self.fail_pending();
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Send a request and wait for its response.
    ///
    /// Fails immediately with `ChannelClosed` on a closed channel, with
    /// `RequestTimeout` when no response arrives in time, and with `Remote`
    /// when the execution process answers with an error.
    pub async fn send_request(&self, request: &ControlRequest) -> Result<Value, IpcError> {
        self.send_request_with_timeout(request, self.inner.request_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<Value, IpcError> {
        if self.is_closed() {
            return Err(IpcError::ChannelClosed);
        }

        let request_id = Uuid::new_v4().to_string();
        let envelope = request.to_envelope(&self.inner.account_id, &request_id)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.inner.pending);
            // Callers that gave up leave closed senders behind.
            pending.retain(|_, waiting| !waiting.is_closed());
            pending.insert(request_id.clone(), tx);
        }

        debug!(
            account_id = %self.inner.account_id,
            %request_id,
            msg_type = %envelope.msg_type,
            "Sending request"
        );

        if let Err(e) = self.inner.sender.send(envelope).await {
            lock(&self.inner.pending).remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?.into_result(),
            Ok(Err(_)) => Err(IpcError::ChannelClosed),
            Err(_) => {
                lock(&self.inner.pending).remove(&request_id);
                warn!(
                    account_id = %self.inner.account_id,
                    %request_id,
                    ?timeout,
                    "Request timed out"
                );
                Err(IpcError::RequestTimeout {
                    request_id,
                    timeout,
                })
            }
        }
    }

    /// Drive the receive side until the channel closes or breaks.
    ///
    /// On exit every pending caller fails with `ChannelClosed` and the
    /// supervisor is told the channel was lost.
    pub async fn run(self, mut receiver: ChannelReceiver) {
        let reason = loop {
            match receiver.receive().await {
                Ok(envelope) => {
                    self.inner.heartbeat.touch();
                    self.dispatch(envelope);
                }
                Err(e) if e.is_fatal() => break e,
                Err(e) => {
                    warn!(account_id = %self.inner.account_id, error = %e, "Receive error");
                }
            }
        };

        info!(
            account_id = %self.inner.account_id,
            generation = self.inner.generation,
            reason = %reason,
            "Channel to execution process lost"
        );
        self.close();
        self.notify(SupervisorEvent::ChannelLost {
            account_id: self.inner.account_id.clone(),
            generation: self.inner.generation,
            reason: reason.to_string(),
        });
    }

    fn dispatch(&self, envelope: Envelope) {
        let kind = match envelope.kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(account_id = %self.inner.account_id, error = %e, "Dropping envelope");
                return;
            }
        };

        match kind {
            MessageType::Response => self.resolve(envelope),
            MessageType::Register => {
                match envelope.payload::<RegisterInfo>() {
                    Ok(info) => self.notify(SupervisorEvent::Registered {
                        account_id: self.inner.account_id.clone(),
                        generation: self.inner.generation,
                        info,
                    }),
                    Err(e) => {
                        warn!(account_id = %self.inner.account_id, error = %e, "Malformed register");
                    }
                }
                self.forward(&envelope);
            }
            MessageType::Heartbeat => {}
            kind if kind.is_request() => {
                warn!(
                    account_id = %self.inner.account_id,
                    msg_type = %kind,
                    "Ignoring request sent by execution process"
                );
            }
            _ => self.forward(&envelope),
        }
    }

    fn resolve(&self, envelope: Envelope) {
        let Some(request_id) = envelope.request_id.clone() else {
            warn!(account_id = %self.inner.account_id, "Response without request_id");
            return;
        };

        let waiting = lock(&self.inner.pending).remove(&request_id);
        match waiting {
            Some(tx) => {
                let body = envelope.payload::<ResponseBody>();
                if tx.send(body).is_err() {
                    debug!(%request_id, "Caller stopped waiting for response");
                }
            }
            None => {
                warn!(
                    account_id = %self.inner.account_id,
                    %request_id,
                    "Discarding unmatched response"
                );
            }
        }
    }

    fn forward(&self, envelope: &Envelope) {
        let callbacks = lock(&self.inner.callbacks).clone();
        for callback in callbacks {
            callback(&self.inner.account_id, envelope);
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = lock(&self.inner.pending).drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(IpcError::ChannelClosed));
        }
    }

    fn notify(&self, event: SupervisorEvent) {
        if let Some(events) = &self.inner.events {
            if events.send(event).is_err() {
                debug!(account_id = %self.inner.account_id, "Supervisor gone, event dropped");
            }
        }
    }
}

impl std::fmt::Debug for ExecutionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionProxy")
            .field("account_id", &self.inner.account_id)
            .field("generation", &self.inner.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
