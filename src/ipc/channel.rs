//! Duplex envelope channel over any byte stream.
//!
//! Outgoing envelopes go through a bounded queue drained by a single writer
//! task, so `send` suspends when the peer stops reading. Closing is shared
//! between all holders through a `watch` flag. Envelopes already queued when
//! the channel closes are still written, within [`DRAIN_TIMEOUT`].

use super::codec::{decode, write_frame, Envelope};
use crate::error::IpcError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Default number of envelopes queued before `send` applies backpressure.
pub const DEFAULT_SEND_CAPACITY: usize = 256;

/// Upper bound on flushing queued envelopes after close.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte stream a channel can run over.
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> IpcStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedStream = Box<dyn IpcStream>;

/// Close flag shared by every half of one channel.
#[derive(Clone)]
struct CloseSignal(Arc<watch::Sender<bool>>);

impl CloseSignal {
    fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    fn close(&self) {
        self.0.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so `wait_for` cannot fail here.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A framed, closable, bidirectional envelope channel.
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    pub fn new<S: IpcStream>(stream: S) -> Self {
        Self::with_capacity(stream, DEFAULT_SEND_CAPACITY)
    }

    /// Wrap a stream, bounding the outgoing queue at `capacity` envelopes.
    pub fn with_capacity<S: IpcStream>(stream: S, capacity: usize) -> Self {
        let stream: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);
        let signal = CloseSignal::new();
        let flushed = CloseSignal::new();
        let (tx, rx) = mpsc::channel(capacity.max(1));

        tokio::spawn(writer_loop(write_half, rx, signal.clone(), flushed.clone()));

        Self {
            sender: ChannelSender {
                tx,
                signal: signal.clone(),
                flushed,
            },
            receiver: ChannelReceiver {
                reader: BufReader::new(read_half),
                signal,
            },
        }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), IpcError> {
        self.sender.send(envelope).await
    }

    pub async fn receive(&mut self) -> Result<Envelope, IpcError> {
        self.receiver.receive().await
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// A cloneable handle for sending from other tasks.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half. Cheap to clone; all clones share one close flag.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Envelope>,
    signal: CloseSignal,
    /// Set once the writer task has finished.
    flushed: CloseSignal,
}

impl ChannelSender {
    /// Queue an envelope for the writer task.
    ///
    /// Suspends while the queue is full. Fails with `ChannelClosed` once the
    /// channel is closed or the connection is gone.
    pub async fn send(&self, envelope: Envelope) -> Result<(), IpcError> {
        if self.signal.is_closed() {
            return Err(IpcError::ChannelClosed);
        }
        tokio::select! {
            res = self.tx.send(envelope) => res.map_err(|_| IpcError::ChannelClosed),
            _ = self.signal.closed() => Err(IpcError::ChannelClosed),
        }
    }

    /// Queue without waiting. Fails with `ChannelClosed` when the queue is
    /// full or the channel is closed.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), IpcError> {
        if self.signal.is_closed() {
            return Err(IpcError::ChannelClosed);
        }
        self.tx
            .try_send(envelope)
            .map_err(|_| IpcError::ChannelClosed)
    }

    /// Idempotent.
    pub fn close(&self) {
        self.signal.close();
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    /// Resolves once the channel is closed by any holder.
    pub async fn closed(&self) {
        self.signal.closed().await
    }

    /// Resolves once the writer has drained its queue and shut the stream.
    pub async fn flushed(&self) {
        self.flushed.closed().await
    }
}

/// Receiving half.
pub struct ChannelReceiver {
    reader: BufReader<ReadHalf<BoxedStream>>,
    signal: CloseSignal,
}

impl ChannelReceiver {
    /// Wait for the next envelope.
    ///
    /// Framing errors and connection loss close the channel. Do not race
    /// this against other futures: a cancelled read may drop half a frame.
    pub async fn receive(&mut self) -> Result<Envelope, IpcError> {
        if self.signal.is_closed() {
            return Err(IpcError::ChannelClosed);
        }

        let result = tokio::select! {
            res = decode(&mut self.reader) => res,
            _ = self.signal.closed() => Err(IpcError::ChannelClosed),
        };

        if let Err(err) = &result {
            if err.is_fatal() {
                self.signal.close();
            }
        }
        result
    }

    pub fn close(&self) {
        self.signal.close();
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

async fn writer_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<Envelope>,
    signal: CloseSignal,
    flushed: CloseSignal,
) {
    let mut healthy = true;
    loop {
        tokio::select! {
            biased;
            _ = signal.closed() => break,
            next = rx.recv() => match next {
                Some(envelope) => {
                    if let Err(e) = write_frame(&mut writer, &envelope).await {
                        warn!(error = %e, msg_type = %envelope.msg_type, "Channel write failed");
                        healthy = false;
                        break;
                    }
                }
                None => break,
            },
        }
    }
    signal.close();

    if healthy {
        let drain = async {
            while let Ok(envelope) = rx.try_recv() {
                if write_frame(&mut writer, &envelope).await.is_err() {
                    break;
                }
            }
            writer.shutdown().await
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(Err(e)) => debug!(error = %e, "Channel shutdown failed"),
            Err(_) => debug!("Channel drain timed out"),
            Ok(Ok(())) => {}
        }
    }
    flushed.close();
}
