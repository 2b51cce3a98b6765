use log::{info, warn};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{EngineError, EngineResult},
    metrics::MetricsCollector,
    transport::FrameSender,
};

use super::{DispatchConfig, DispatchNotice, Dispatcher, FrameSource};

/// Owns the frame source between sessions and the dispatcher task during one.
pub struct DispatchController {
    source: Option<Box<dyn FrameSource>>,
    handle: Option<JoinHandle<Box<dyn FrameSource>>>,
    cancel_token: Option<CancellationToken>,
    pause_tx: Option<watch::Sender<bool>>,
}

impl DispatchController {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source: Some(source),
            handle: None,
            cancel_token: None,
            pause_tx: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(
        &mut self,
        config: &DispatchConfig,
        frames: FrameSender,
        notices: mpsc::Sender<DispatchNotice>,
        metrics: MetricsCollector,
    ) -> EngineResult<()> {
        if self.handle.is_some() {
            return Err(EngineError::invalid_state("dispatch start", "running"));
        }
        let mut source = self.source.take().ok_or(EngineError::FrameSourceUnavailable)?;
        source.restart();

        let cancel_token = CancellationToken::new();
        // Paused until the transport reports connected.
        let (pause_tx, pause_rx) = watch::channel(true);
        let dispatcher = Dispatcher::new(config.rate_policy(), frames, notices, pause_rx, metrics);
        let handle = tokio::spawn(dispatcher.run(source, cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.pause_tx = Some(pause_tx);
        Ok(())
    }

    pub fn set_paused(&self, paused: bool) {
        if let Some(tx) = &self.pause_tx {
            tx.send_replace(paused);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_tx.as_ref().map(|tx| *tx.borrow()).unwrap_or(true)
    }

    /// Stops the dispatcher and takes the frame source back.
    pub async fn stop(&mut self) -> EngineResult<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.pause_tx = None;

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(source) => {
                self.source = Some(source);
                info!("dispatcher stopped");
                Ok(())
            }
            Err(err) => {
                warn!("dispatcher task failed to join, frame source lost: {err}");
                Err(EngineError::FrameSourceUnavailable)
            }
        }
    }
}
