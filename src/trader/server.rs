//! Execution-side end of the control channel.
//!
//! Listens on the account's Unix socket and serves one control connection
//! at a time. Every accepted connection starts with `register`, then gets
//! periodic heartbeats and sequenced telemetry pushes. Requests are handed
//! to a [`RequestHandler`] and answered with `response` envelopes.

use crate::config::IpcConfig;
use crate::ipc::{
    Channel, ChannelReceiver, ChannelSender, ControlRequest, Envelope, HeartbeatInfo, IpcStream,
    MessageType, RegisterInfo, ResponseBody,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Answers control requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: ControlRequest) -> ResponseBody;
}

/// The connection pushes currently go to.
#[derive(Clone)]
struct PushTarget {
    connection_id: u64,
    sender: ChannelSender,
    /// Last stamped seq. Held across the send so frames hit the wire in seq order.
    seq: Arc<Mutex<u64>>,
}

struct ServerInner {
    account_id: String,
    handler: Arc<dyn RequestHandler>,
    heartbeat_interval: Duration,
    send_capacity: usize,
    started_at: DateTime<Utc>,
    active: watch::Sender<Option<PushTarget>>,
    next_connection: AtomicU64,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ChannelServer {
    inner: Arc<ServerInner>,
}

impl ChannelServer {
    pub fn new(account_id: &str, ipc: &IpcConfig, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                account_id: account_id.to_string(),
                handler,
                heartbeat_interval: ipc.heartbeat_interval(),
                send_capacity: ipc.send_capacity,
                started_at: Utc::now(),
                active: watch::channel(None).0,
                next_connection: AtomicU64::new(0),
                shutdown: watch::channel(false).0,
            }),
        }
    }

    /// Handle for pushing telemetry to whichever connection is active.
    pub fn push_handle(&self) -> PushHandle {
        PushHandle {
            inner: self.inner.clone(),
        }
    }

    /// Flips to `true` once the server is shutting down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .active
            .borrow()
            .as_ref()
            .is_some_and(|t| !t.sender.is_closed())
    }

    /// Serve a freshly accepted stream.
    ///
    /// Returns `None` and drops the stream when another connection is
    /// already active.
    pub fn accept<S: IpcStream>(&self, stream: S) -> Option<JoinHandle<()>> {
        let inner = &self.inner;
        let (sender, receiver) = Channel::with_capacity(stream, inner.send_capacity).split();

        let register = RegisterInfo {
            pid: std::process::id(),
            started_at: inner.started_at,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let register = match Envelope::with_payload(MessageType::Register, &inner.account_id, &register) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(account_id = %inner.account_id, error = %e, "Failed to encode register");
                sender.close();
                return None;
            }
        };

        let target = PushTarget {
            connection_id: inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1,
            sender,
            seq: Arc::new(Mutex::new(0)),
        };
        // Register is queued under the slot lock so no push can precede it.
        let mut refused = None;
        let accepted = inner.active.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|t| !t.sender.is_closed()) {
                refused = Some("another control connection is active".to_string());
                return false;
            }
            if let Err(e) = target.sender.try_send(register.clone()) {
                refused = Some(e.to_string());
                return false;
            }
            *slot = Some(target.clone());
            true
        });
        if !accepted {
            warn!(
                account_id = %inner.account_id,
                reason = refused.as_deref().unwrap_or("unknown"),
                "Control connection refused"
            );
            target.sender.close();
            return None;
        }

        info!(
            account_id = %inner.account_id,
            connection_id = target.connection_id,
            "Control connection accepted"
        );
        Some(tokio::spawn(serve_connection(inner.clone(), target, receiver)))
    }

    /// Bind `socket_path` and accept connections until shutdown.
    pub async fn run(&self, socket_path: &Path) -> std::io::Result<()> {
        if let Some(dir) = socket_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => debug!(socket = %socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(
            account_id = %self.inner.account_id,
            socket = %socket_path.display(),
            "Channel server listening"
        );

        let mut shutdown = self.shutdown_signal();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, _)) => {
                        self.accept(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {}
            }
        }

        drop(listener);
        if let Err(e) = tokio::fs::remove_file(socket_path).await {
            debug!(error = %e, "Socket cleanup failed");
        }
        self.close_active().await;
        info!(account_id = %self.inner.account_id, "Channel server stopped");
        Ok(())
    }

    /// Close the active connection once its queued envelopes are written.
    async fn close_active(&self) {
        let target = self.inner.active.borrow().clone();
        if let Some(target) = target {
            target.sender.close();
            target.sender.flushed().await;
        }
    }
}

/// Sends telemetry to the active connection, stamping a per-connection
/// sequence number. Pushes made while disconnected are dropped.
#[derive(Clone)]
pub struct PushHandle {
    inner: Arc<ServerInner>,
}

impl PushHandle {
    pub async fn push<T: Serialize>(&self, kind: MessageType, payload: &T) {
        let target = self.inner.active.borrow().clone();
        let Some(target) = target else {
            return;
        };
        let envelope = match Envelope::with_payload(kind, &self.inner.account_id, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(msg_type = %kind, error = %e, "Failed to encode push");
                return;
            }
        };
        let mut last = target.seq.lock().await;
        let seq = *last + 1;
        match target.sender.send(envelope.with_seq(seq)).await {
            Ok(()) => *last = seq,
            Err(e) => debug!(msg_type = %kind, seq, error = %e, "Push dropped"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .active
            .borrow()
            .as_ref()
            .is_some_and(|t| !t.sender.is_closed())
    }
}

async fn serve_connection(
    inner: Arc<ServerInner>,
    target: PushTarget,
    mut receiver: ChannelReceiver,
) {
    let connection_id = target.connection_id;
    let heartbeat = tokio::spawn(heartbeat_loop(
        inner.account_id.clone(),
        target.sender.clone(),
        inner.heartbeat_interval,
    ));

    loop {
        let envelope = match receiver.receive().await {
            Ok(envelope) => envelope,
            Err(e) if e.is_fatal() => {
                info!(account_id = %inner.account_id, connection_id, reason = %e, "Control connection ended");
                break;
            }
            Err(e) => {
                warn!(account_id = %inner.account_id, error = %e, "Receive failed");
                continue;
            }
        };
        dispatch(&inner, &target.sender, envelope);
    }

    heartbeat.abort();
    target.sender.close();
    inner.active.send_if_modified(|slot| match slot {
        Some(t) if t.connection_id == connection_id => {
            *slot = None;
            true
        }
        _ => false,
    });
}

/// Route one inbound envelope. Requests are answered from their own task.
fn dispatch(inner: &Arc<ServerInner>, sender: &ChannelSender, envelope: Envelope) {
    let kind = match envelope.kind() {
        Ok(kind) => kind,
        Err(e) => {
            warn!(account_id = %inner.account_id, error = %e, "Dropping envelope");
            return;
        }
    };
    if !kind.is_request() {
        debug!(account_id = %inner.account_id, msg_type = %kind, "Ignoring non-request envelope");
        return;
    }
    let Some(request_id) = envelope.request_id.clone() else {
        warn!(account_id = %inner.account_id, msg_type = %kind, "Request without request_id");
        return;
    };

    let inner = inner.clone();
    let sender = sender.clone();
    tokio::spawn(async move {
        let (body, stop) = match ControlRequest::from_envelope(&envelope) {
            Ok(request) => {
                let stop = request == ControlRequest::Stop;
                (inner.handler.handle(request).await, stop)
            }
            Err(e) => {
                warn!(account_id = %inner.account_id, %request_id, error = %e, "Malformed request");
                (ResponseBody::error(e.to_string()), false)
            }
        };

        match body.to_envelope(&inner.account_id, &request_id) {
            Ok(response) => {
                if let Err(e) = sender.send(response).await {
                    debug!(%request_id, error = %e, "Response not delivered");
                }
            }
            Err(e) => warn!(%request_id, error = %e, "Failed to encode response"),
        }

        if stop {
            info!(account_id = %inner.account_id, "Stop requested by control process");
            inner.shutdown.send_replace(true);
        }
    });
}

async fn heartbeat_loop(account_id: String, sender: ChannelSender, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let beat = HeartbeatInfo { sent_at: Utc::now() };
                let envelope = match Envelope::with_payload(MessageType::Heartbeat, &account_id, &beat) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode heartbeat");
                        continue;
                    }
                };
                if sender.send(envelope).await.is_err() {
                    break;
                }
            }
            _ = sender.closed() => break,
        }
    }
}
