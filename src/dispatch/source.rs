use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use tokio::{
    sync::mpsc,
    time::{Interval, MissedTickBehavior},
};

use crate::models::CapturedFrame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Lazy sequence of timestamped frames. `None` ends the current run.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<CapturedFrame>;

    /// Rewinds before a new session. Sources that cannot rewind ignore it.
    fn restart(&mut self) {}
}

/// Replays image files from a directory at a fixed cadence, looping.
pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    position: usize,
    interval: Duration,
    ticker: Option<Interval>,
}

impl DirectoryFrameSource {
    pub fn open(dir: impl AsRef<Path>, interval: Duration) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read frames dir {}", dir.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            bail!("no image files in {}", dir.display());
        }
        files.sort();

        Ok(Self {
            files,
            position: 0,
            interval,
            ticker: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl FrameSource for DirectoryFrameSource {
    async fn next_frame(&mut self) -> Option<CapturedFrame> {
        let interval = self.interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        ticker.tick().await;

        // Skip unreadable files, but give up after one full lap.
        for _ in 0..self.files.len() {
            let path = &self.files[self.position];
            self.position = (self.position + 1) % self.files.len();
            match tokio::fs::read(path).await {
                Ok(bytes) => return Some(CapturedFrame::new(Utc::now(), bytes)),
                Err(err) => warn!("skipping frame {}: {err}", path.display()),
            }
        }
        None
    }

    fn restart(&mut self) {
        self.position = 0;
        self.ticker = None;
    }
}

/// Frames pushed by an external capture pipeline.
pub struct ChannelFrameSource {
    rx: mpsc::Receiver<CapturedFrame>,
}

impl ChannelFrameSource {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<CapturedFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { rx }, tx)
    }
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    async fn next_frame(&mut self) -> Option<CapturedFrame> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn directory_source_loops_in_name_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.path().join("a.png"), b"first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = DirectoryFrameSource::open(dir.path(), Duration::from_millis(1)).unwrap();
        assert_eq!(source.len(), 2);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame = source.next_frame().await.unwrap();
            seen.push(frame.payload.into_inner());
        }
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec(), b"first".to_vec()]);

        source.restart();
        let frame = source.next_frame().await.unwrap();
        assert_eq!(frame.payload.into_inner(), b"first".to_vec());
    }

    #[test]
    fn directory_without_images_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), b"-").unwrap();
        assert!(DirectoryFrameSource::open(dir.path(), Duration::from_millis(10)).is_err());
    }

    #[tokio::test]
    async fn channel_source_ends_when_sender_dropped() {
        let (mut source, tx) = ChannelFrameSource::new(4);
        tx.send(CapturedFrame::new(Utc::now(), vec![1])).await.unwrap();
        drop(tx);
        assert!(source.next_frame().await.is_some());
        assert!(source.next_frame().await.is_none());
    }
}
