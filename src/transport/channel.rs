use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::models::FrameEnvelope;

use super::{
    backoff::Backoff,
    connector::{Connector, TransportStream},
    wire::{self, Header},
    SendError, TransportConfig, TransportEvent, TransportStatus,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

type Reader = ReadHalf<Box<dyn TransportStream>>;
type Writer = WriteHalf<Box<dyn TransportStream>>;

/// Handle to the background task that owns the backend connection.
///
/// Outbound frames go through a bounded queue; inbound results, welcomes and
/// status changes come back on the `events` sender in the order they were
/// read off the wire. The task holds at most one live connection.
pub struct TransportChannel {
    outbound_tx: mpsc::Sender<FrameEnvelope>,
    status_rx: watch::Receiver<TransportStatus>,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl TransportChannel {
    /// Spawns the connection task and returns immediately.
    pub fn open(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_size.max(1));
        let (status_tx, status_rx) = watch::channel(TransportStatus::Disconnected);
        let cancel_token = CancellationToken::new();
        let close_timeout = Duration::from_millis(config.close_timeout_ms);

        let task = ChannelTask {
            connector,
            config,
            outbound_rx,
            events,
            status_tx,
            cancel_token: cancel_token.clone(),
        };
        let handle = tokio::spawn(task.run());

        Self {
            outbound_tx,
            status_rx,
            cancel_token,
            handle: Some(handle),
            close_timeout,
        }
    }

    /// Queues a frame without waiting. A full queue hands the frame back.
    pub fn send(&self, envelope: FrameEnvelope) -> Result<(), SendError> {
        self.sender().send(envelope)
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender {
            tx: self.outbound_tx.clone(),
        }
    }

    pub fn status(&self) -> TransportStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TransportStatus> {
        self.status_rx.clone()
    }

    /// Flushes queued frames and closes the connection, bounded by the
    /// configured close timeout.
    pub async fn close(&mut self) {
        self.cancel_token.cancel();
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        // Flush gets one close timeout; allow a second for the shutdown itself.
        match timeout(self.close_timeout * 2, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log_warn!("transport task ended abnormally: {err}"),
            Err(_) => {
                log_warn!("transport task did not settle in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Clonable producer side of the outbound queue, for the dispatcher.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<FrameEnvelope>,
}

impl FrameSender {
    pub fn send(&self, envelope: FrameEnvelope) -> Result<(), SendError> {
        self.tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(envelope) => SendError::Backpressure(envelope),
            mpsc::error::TrySendError::Closed(envelope) => SendError::Closed(envelope),
        })
    }
}

enum ConnectionEnd {
    Cancelled,
    Lost(String),
}

struct ChannelTask {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    outbound_rx: mpsc::Receiver<FrameEnvelope>,
    events: mpsc::Sender<TransportEvent>,
    status_tx: watch::Sender<TransportStatus>,
    cancel_token: CancellationToken,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut backoff = Backoff::from_config(&self.config);
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        self.publish(TransportStatus::Connecting).await;

        loop {
            let attempt = tokio::select! {
                res = timeout(connect_timeout, self.connector.connect()) => res,
                _ = self.cancel_token.cancelled() => break,
            };

            let failure = match attempt {
                Ok(Ok(stream)) => {
                    log_info!("connected to {}", self.connector.describe());
                    backoff.reset();
                    self.publish(TransportStatus::Connected).await;

                    match self.serve(stream).await {
                        ConnectionEnd::Cancelled => break,
                        ConnectionEnd::Lost(reason) => {
                            // Frames queued for the dead connection are stale by now.
                            let mut dropped = 0usize;
                            while self.outbound_rx.try_recv().is_ok() {
                                dropped += 1;
                            }
                            if dropped > 0 {
                                log_debug!("discarded {dropped} queued frames after disconnect");
                            }
                            self.publish(TransportStatus::Reconnecting).await;
                            reason
                        }
                    }
                }
                Ok(Err(err)) => format!("connect to {} failed: {err}", self.connector.describe()),
                Err(_) => format!(
                    "connect to {} timed out after {}ms",
                    self.connector.describe(),
                    self.config.connect_timeout_ms
                ),
            };

            self.emit(TransportEvent::Error(failure.clone())).await;

            let Some(delay) = backoff.next_delay() else {
                log_warn!(
                    "giving up on {} after {} attempts: {failure}",
                    self.connector.describe(),
                    backoff.attempts()
                );
                self.emit(TransportEvent::Exhausted {
                    attempts: backoff.attempts(),
                    last_error: failure,
                })
                .await;
                self.publish(TransportStatus::Disconnected).await;
                return;
            };

            log_warn!(
                "retry {}/{} in {}ms: {failure}",
                backoff.attempts(),
                self.config.max_retries,
                delay.as_millis()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel_token.cancelled() => break,
            }
        }

        self.publish(TransportStatus::Closed).await;
    }

    async fn serve(&mut self, stream: Box<dyn TransportStream>) -> ConnectionEnd {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader_task = tokio::spawn(read_loop(reader, self.events.clone()));
        let write_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    self.flush(&mut writer).await;
                    let _ = writer.shutdown().await;
                    break ConnectionEnd::Cancelled;
                }
                reason = &mut reader_task => {
                    let reason = reason.unwrap_or_else(|err| format!("reader task failed: {err}"));
                    return ConnectionEnd::Lost(reason);
                }
                next = self.outbound_rx.recv() => {
                    let Some(envelope) = next else {
                        break ConnectionEnd::Cancelled;
                    };
                    let seq = envelope.sequence_number;
                    match timeout(write_timeout, wire::write_frame(&mut writer, &envelope)).await {
                        Ok(Ok(())) => log_debug!("sent frame {seq}"),
                        Ok(Err(err)) => break ConnectionEnd::Lost(format!("send failed: {err}")),
                        Err(_) => break ConnectionEnd::Lost("send timed out".to_string()),
                    }
                }
            }
        };

        reader_task.abort();
        end
    }

    /// Writes whatever is still queued, within the close timeout.
    async fn flush(&mut self, writer: &mut Writer) {
        let outbound_rx = &mut self.outbound_rx;
        let drain = async {
            let mut flushed = 0usize;
            while let Ok(envelope) = outbound_rx.try_recv() {
                if wire::write_frame(writer, &envelope).await.is_err() {
                    break;
                }
                flushed += 1;
            }
            flushed
        };
        match timeout(Duration::from_millis(self.config.close_timeout_ms), drain).await {
            Ok(flushed) => log_debug!("flushed {flushed} frames on close"),
            Err(_) => log_warn!("flush on close timed out"),
        }
    }

    async fn publish(&self, status: TransportStatus) {
        if *self.status_tx.borrow() == status {
            return;
        }
        self.status_tx.send_replace(status);
        self.emit(TransportEvent::Status(status)).await;
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            log_debug!("transport event dropped, receiver gone");
        }
    }
}

/// Forwards inbound messages until the stream ends; returns why it ended.
async fn read_loop(mut reader: Reader, events: mpsc::Sender<TransportEvent>) -> String {
    loop {
        let message = match wire::read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => return "connection closed by backend".to_string(),
            Err(err) => return format!("receive failed: {err}"),
        };

        let event = match message.header {
            Header::Result(result) => TransportEvent::Result(result),
            Header::Welcome { client_id } => TransportEvent::Welcome { client_id },
            Header::Error { message } => {
                log_warn!("backend reported error: {message}");
                TransportEvent::Error(format!("backend: {message}"))
            }
            Header::Frame { .. } | Header::Unknown => continue,
        };

        if events.send(event).await.is_err() {
            return "event receiver dropped".to_string();
        }
    }
}
