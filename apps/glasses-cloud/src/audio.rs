//! Microphone audio ahead of the transcription backend.
//!
//! Frames arriving before the backend is ready wait in a FIFO. A frame leaves
//! the FIFO only once the backend has accepted it, so a failed push leaves it
//! at the head for the next backend to replay.

use std::collections::VecDeque;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::{
    dynamics::{AudioProcessorConfig, DynamicsProcessor},
    transcription::{BackendError, TranscriptionBackend},
};

pub const DEFAULT_MAX_BUFFERED_FRAMES: usize = 1500;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioSettings {
    /// Compressor applied to every frame before it reaches the backend.
    pub processor: Option<AudioProcessorConfig>,
    pub max_buffered_frames: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            processor: None,
            max_buffered_frames: DEFAULT_MAX_BUFFERED_FRAMES,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Streamed,
    Buffered,
    /// The backend refused a frame and was dropped; the frame is buffered.
    BackendFailed(BackendError),
}

pub struct AudioPipeline {
    buffer: VecDeque<Vec<u8>>,
    backend: Option<Box<dyn TranscriptionBackend>>,
    processor: Option<DynamicsProcessor>,
    max_buffered_frames: usize,
    is_transcribing: bool,
    backend_pending: bool,
    dropped_frames: u64,
    session_id: String,
}

impl AudioPipeline {
    pub fn new(session_id: impl Into<String>, settings: &AudioSettings) -> Self {
        Self {
            buffer: VecDeque::new(),
            backend: None,
            processor: settings.processor.map(DynamicsProcessor::new),
            max_buffered_frames: settings.max_buffered_frames.max(1),
            is_transcribing: false,
            backend_pending: false,
            dropped_frames: 0,
            session_id: session_id.into(),
        }
    }

    pub fn is_transcribing(&self) -> bool {
        self.is_transcribing
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Claims the right to start a backend. Returns `false` while one is
    /// running or already being started.
    pub fn begin_backend_init(&mut self) -> bool {
        if self.backend.is_some() || self.backend_pending {
            return false;
        }
        self.backend_pending = true;
        true
    }

    pub fn append(&mut self, frame: &[u8]) -> AppendOutcome {
        let frame = match self.processor.as_mut() {
            Some(processor) => processor.process(frame),
            None => frame.to_vec(),
        };
        self.buffer.push_back(frame);

        if self.backend.is_none() {
            self.enforce_bound();
            return AppendOutcome::Buffered;
        }

        match self.drain() {
            Ok(_) => AppendOutcome::Streamed,
            Err(err) => AppendOutcome::BackendFailed(err),
        }
    }

    /// Installs the backend and flushes everything buffered so far, oldest
    /// first. Returns how many frames were flushed.
    pub fn backend_ready(
        &mut self,
        backend: Box<dyn TranscriptionBackend>,
    ) -> Result<usize, BackendError> {
        self.backend_pending = false;
        self.backend = Some(backend);
        self.is_transcribing = true;

        let flushed = self.drain()?;
        histogram!("glasses_cloud_audio_flush_frames", flushed as f64);
        info!(
            session_id = %self.session_id,
            flushed,
            "transcription backend ready"
        );
        Ok(flushed)
    }

    /// Drops the backend. Buffered frames are kept for the next one.
    pub fn backend_failed(&mut self, reason: &str) {
        self.backend_pending = false;
        self.is_transcribing = false;
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        warn!(
            session_id = %self.session_id,
            reason,
            buffered = self.buffer.len(),
            "transcription backend failed"
        );
        counter!("glasses_cloud_transcription_failures_total", 1);
    }

    /// Releases the backend and discards buffered audio.
    pub fn shutdown(&mut self) {
        self.is_transcribing = false;
        self.backend_pending = false;
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        self.buffer.clear();
    }

    fn drain(&mut self) -> Result<usize, BackendError> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(0);
        };

        let mut pushed = 0;
        while let Some(frame) = self.buffer.front() {
            if let Err(err) = backend.push_frame(frame) {
                self.backend_failed(&err.to_string());
                return Err(err);
            }
            self.buffer.pop_front();
            pushed += 1;
        }
        Ok(pushed)
    }

    fn enforce_bound(&mut self) {
        while self.buffer.len() > self.max_buffered_frames {
            self.buffer.pop_front();
            self.dropped_frames += 1;
            if self.dropped_frames == 1 || self.dropped_frames % 100 == 0 {
                warn!(
                    session_id = %self.session_id,
                    dropped = self.dropped_frames,
                    limit = self.max_buffered_frames,
                    "audio buffer full; dropping oldest frame"
                );
            }
            counter!("glasses_cloud_audio_frames_dropped_total", 1);
        }
        debug!(session_id = %self.session_id, buffered = self.buffer.len(), "audio frame buffered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_on: Arc<Mutex<Option<usize>>>,
    }

    impl Recorder {
        fn failing_on(index: usize) -> Self {
            let recorder = Self::default();
            *recorder.fail_on.lock() = Some(index);
            recorder
        }

        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().clone()
        }
    }

    impl TranscriptionBackend for Recorder {
        fn push_frame(&mut self, frame: &[u8]) -> Result<(), BackendError> {
            let mut frames = self.frames.lock();
            if *self.fail_on.lock() == Some(frames.len()) {
                return Err(BackendError::Rejected("socket reset".into()));
            }
            frames.push(frame.to_vec());
            Ok(())
        }
    }

    fn pipeline(max: usize) -> AudioPipeline {
        AudioPipeline::new(
            "session-1",
            &AudioSettings {
                processor: None,
                max_buffered_frames: max,
            },
        )
    }

    #[test]
    fn frames_buffered_before_ready_flush_once_in_order() {
        let mut audio = pipeline(16);
        for frame in [b"f1", b"f2", b"f3"] {
            assert_eq!(audio.append(frame), AppendOutcome::Buffered);
        }
        assert!(!audio.is_transcribing());

        let recorder = Recorder::default();
        assert_eq!(audio.backend_ready(Box::new(recorder.clone())), Ok(3));
        assert!(audio.is_transcribing());
        assert_eq!(audio.buffered_frames(), 0);

        assert_eq!(audio.append(b"f4"), AppendOutcome::Streamed);
        assert_eq!(
            recorder.frames(),
            vec![b"f1".to_vec(), b"f2".to_vec(), b"f3".to_vec(), b"f4".to_vec()]
        );
    }

    #[test]
    fn failed_push_keeps_frame_for_the_next_backend() {
        let mut audio = pipeline(16);
        audio.append(b"f1");
        audio.append(b"f2");
        audio.append(b"f3");

        let flaky = Recorder::failing_on(1);
        let err = audio.backend_ready(Box::new(flaky.clone())).unwrap_err();
        assert_eq!(err, BackendError::Rejected("socket reset".into()));
        assert!(!audio.is_transcribing());
        assert_eq!(flaky.frames(), vec![b"f1".to_vec()]);
        assert_eq!(audio.buffered_frames(), 2);

        assert_eq!(audio.append(b"f4"), AppendOutcome::Buffered);

        let healthy = Recorder::default();
        assert_eq!(audio.backend_ready(Box::new(healthy.clone())), Ok(3));
        assert_eq!(
            healthy.frames(),
            vec![b"f2".to_vec(), b"f3".to_vec(), b"f4".to_vec()]
        );
    }

    #[test]
    fn asynchronous_failure_returns_to_buffering() {
        let mut audio = pipeline(16);
        let recorder = Recorder::default();
        audio.backend_ready(Box::new(recorder.clone())).unwrap();
        audio.append(b"live");

        audio.backend_failed("vendor hung up");
        assert!(!audio.is_transcribing());
        assert_eq!(audio.append(b"later"), AppendOutcome::Buffered);
        assert_eq!(recorder.frames(), vec![b"live".to_vec()]);
        assert!(audio.begin_backend_init());
        assert!(!audio.begin_backend_init());
    }

    #[test]
    fn overflow_discards_oldest_frames() {
        let mut audio = pipeline(2);
        audio.append(b"a");
        audio.append(b"b");
        audio.append(b"c");
        assert_eq!(audio.buffered_frames(), 2);
        assert_eq!(audio.dropped_frames(), 1);

        let recorder = Recorder::default();
        audio.backend_ready(Box::new(recorder.clone())).unwrap();
        assert_eq!(recorder.frames(), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn processor_runs_before_buffering() {
        let mut audio = AudioPipeline::new(
            "session-1",
            &AudioSettings {
                processor: Some(AudioProcessorConfig::default()),
                max_buffered_frames: 8,
            },
        );
        let frame: Vec<u8> = [328i16, 328].iter().flat_map(|s| s.to_le_bytes()).collect();
        audio.append(&frame);

        let recorder = Recorder::default();
        audio.backend_ready(Box::new(recorder.clone())).unwrap();
        let flushed = recorder.frames();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].len(), frame.len());
        assert_ne!(flushed[0], frame);
    }
}
