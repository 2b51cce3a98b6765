#![allow(dead_code)]

use std::{
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use chrono::{DateTime, Utc};
use drivewatch_lib::{
    db::Database,
    dispatch::{ChannelFrameSource, DispatchConfig},
    models::{CapturedFrame, InferenceResult, RawClassification},
    recorder::SessionRecorder,
    session::{SessionController, StatusSnapshot},
    transport::{
        wire::{self, Header},
        Connector, DuplexConnector, TransportConfig, TransportStream,
    },
    EngineConfig,
};
use tempfile::TempDir;
use tokio::{
    io::DuplexStream,
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
    time::timeout,
};

pub const WAIT: Duration = Duration::from_secs(10);
pub const BACKEND_CLIENT_ID: &str = "assigned-by-backend";

pub type Classifier = Arc<dyn Fn(u64) -> RawClassification + Send + Sync>;

pub struct TestEngine {
    pub controller: SessionController,
    pub frames: mpsc::Sender<CapturedFrame>,
    pub incoming: Option<UnboundedReceiver<DuplexStream>>,
    pub backend: BackendGate,
    pub dir: TempDir,
}

/// Lets a test refuse connects for a while without dropping the acceptor.
#[derive(Clone, Default)]
pub struct BackendGate(Arc<AtomicBool>);

impl BackendGate {
    pub fn refuse(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn accept(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn refusing(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct GatedConnector {
    inner: DuplexConnector,
    gate: BackendGate,
}

#[async_trait]
impl Connector for GatedConnector {
    async fn connect(&self) -> io::Result<Box<dyn TransportStream>> {
        if self.gate.refusing() {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "backend down"));
        }
        self.inner.connect().await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

pub fn engine() -> TestEngine {
    engine_with(|_| {})
}

pub fn engine_with(tweak: impl FnOnce(&mut EngineConfig)) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig {
        client_id: Some("test-client".into()),
        database_path: dir.path().join("engine.sqlite3"),
        transport: TransportConfig {
            connect_timeout_ms: 500,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            max_retries: 2,
            outbound_queue_size: 32,
            jitter_ratio: 0.0,
            close_timeout_ms: 300,
        },
        dispatch: DispatchConfig {
            min_interval_ms: 0,
            ..DispatchConfig::default()
        },
        ..EngineConfig::default()
    };
    tweak(&mut config);

    let recorder = SessionRecorder::new(Database::new(config.database_path.clone()).unwrap());
    let (inner, incoming) = DuplexConnector::new(256 * 1024);
    let backend = BackendGate::default();
    let connector = GatedConnector {
        inner,
        gate: backend.clone(),
    };
    let (source, frames) = ChannelFrameSource::new(64);
    let controller =
        SessionController::new(config, recorder, Arc::new(connector), Box::new(source)).unwrap();

    TestEngine {
        controller,
        frames,
        incoming: Some(incoming),
        backend,
        dir,
    }
}

/// Answers every frame on every accepted connection with `classify(seq)`.
pub fn spawn_backend(
    mut incoming: UnboundedReceiver<DuplexStream>,
    classify: Classifier,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(stream) = incoming.recv().await {
            tokio::spawn(serve(stream, classify.clone()));
        }
    })
}

pub async fn serve(mut stream: DuplexStream, classify: Classifier) {
    let welcome = Header::Welcome {
        client_id: BACKEND_CLIENT_ID.into(),
    };
    if wire::write_message(&mut stream, &welcome, &[]).await.is_err() {
        return;
    }
    while let Ok(Some(message)) = wire::read_message(&mut stream).await {
        if let Header::Frame { seq, .. } = message.header {
            let reply = Header::Result(InferenceResult::for_sequence(seq, classify(seq)));
            if wire::write_message(&mut stream, &reply, &[]).await.is_err() {
                return;
            }
        }
    }
}

/// Reads frames without answering, then answers all of them once the
/// engine hangs up.
pub async fn answer_on_hangup(mut stream: DuplexStream, classify: Classifier) {
    let welcome = Header::Welcome {
        client_id: BACKEND_CLIENT_ID.into(),
    };
    if wire::write_message(&mut stream, &welcome, &[]).await.is_err() {
        return;
    }
    let mut seen = Vec::new();
    while let Ok(Some(message)) = wire::read_message(&mut stream).await {
        if let Header::Frame { seq, .. } = message.header {
            seen.push(seq);
        }
    }
    for seq in seen {
        let reply = Header::Result(InferenceResult::for_sequence(seq, classify(seq)));
        if wire::write_message(&mut stream, &reply, &[]).await.is_err() {
            return;
        }
    }
}

pub fn eyes_closed() -> RawClassification {
    RawClassification {
        face_detected: true,
        ear: Some(0.12),
        eye_closed: true,
        mar: Some(0.2),
        ..RawClassification::default()
    }
}

pub fn attentive() -> RawClassification {
    RawClassification {
        face_detected: true,
        ear: Some(0.31),
        mar: Some(0.2),
        ..RawClassification::default()
    }
}

/// Pushes frames captured `spacing_ms` apart, starting at `base`.
pub async fn send_frames(
    frames: &mpsc::Sender<CapturedFrame>,
    base: DateTime<Utc>,
    count: u64,
    spacing_ms: i64,
) {
    for i in 0..count {
        let captured_at = base + chrono::Duration::milliseconds(i as i64 * spacing_ms);
        frames
            .send(CapturedFrame::new(captured_at, vec![0xAB; 32]))
            .await
            .unwrap();
    }
}

pub async fn wait_for_status(
    controller: &SessionController,
    what: &str,
    predicate: impl Fn(&StatusSnapshot) -> bool,
) -> StatusSnapshot {
    let mut rx = controller.subscribe_status();
    timeout(WAIT, async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if predicate(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("status channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Polls `check` until it returns true.
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
