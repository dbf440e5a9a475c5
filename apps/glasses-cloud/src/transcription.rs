//! Seam to the speech-recognition vendor.
//!
//! A [`TranscriberFactory`] opens one backend per user session. The backend is
//! an ordered frame sink; results and asynchronous failures come back on the
//! [`TranscriptionEvent`] channel handed to the factory.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use glasses_protocol::TranscriptionData;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transcription backend failed to start: {0}")]
    Start(String),
    #[error("transcription backend rejected frame: {0}")]
    Rejected(String),
    #[error("transcription backend closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionEvent {
    Result(TranscriptionData),
    Failed(String),
}

pub type TranscriptionEvents = mpsc::UnboundedSender<TranscriptionEvent>;

pub trait TranscriptionBackend: Send {
    fn push_frame(&mut self, frame: &[u8]) -> Result<(), BackendError>;

    /// Called once when the session drops the backend.
    fn close(&mut self) {}
}

#[async_trait]
pub trait TranscriberFactory: Send + Sync + 'static {
    async fn start(
        &self,
        session_id: &str,
        events: TranscriptionEvents,
    ) -> Result<Box<dyn TranscriptionBackend>, BackendError>;
}

/// Accepts and drops audio. Used when no vendor is configured.
#[derive(Debug, Clone, Default)]
pub struct DiscardingTranscriber {
    frames: Arc<AtomicU64>,
}

impl DiscardingTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames accepted across every backend this factory opened.
    pub fn frames_accepted(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TranscriberFactory for DiscardingTranscriber {
    async fn start(
        &self,
        _session_id: &str,
        _events: TranscriptionEvents,
    ) -> Result<Box<dyn TranscriptionBackend>, BackendError> {
        Ok(Box::new(DiscardingBackend {
            frames: Arc::clone(&self.frames),
        }))
    }
}

struct DiscardingBackend {
    frames: Arc<AtomicU64>,
}

impl TranscriptionBackend for DiscardingBackend {
    fn push_frame(&mut self, _frame: &[u8]) -> Result<(), BackendError> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
