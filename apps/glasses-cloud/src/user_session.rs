//! Per-user session state on the cloud.
//!
//! Everything mutable sits behind one mutex: apps, subscriptions, the display
//! and the audio pipeline. Nothing awaits while holding it; outbound frames
//! go through bounded per-connection channels with `try_send`.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Weak},
};

use glasses_protocol::{
    AppSettings, AppStateChange, CloudToGlasses, CloudToTpa, DataStream, DisplayRequest,
    GlassesConnectionAck, InstalledApp, Layout, StreamType, TranscriptionData,
};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    apps::{AppSession, AppState},
    audio::{AppendOutcome, AudioPipeline, AudioSettings},
    display::{ActiveDisplay, DisplayManager},
    transcription::{TranscriberFactory, TranscriptionBackend, TranscriptionEvent},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("app {0} is not installed")]
    AppNotInstalled(String),
    #[error("app {0} is not running")]
    AppNotRunning(String),
    #[error("session has been terminated")]
    Terminated,
}

/// What the writer task of a connection puts on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl Frame {
    fn json<T: Serialize>(message: &T) -> Option<Self> {
        match glasses_protocol::encode(message) {
            Ok(text) => Some(Frame::Text(text)),
            Err(err) => {
                warn!(error = %err, "failed to encode outbound frame");
                None
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
            Frame::Close => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns `true` if the frame was queued. A full queue drops the frame;
    /// a closed one is left for the connection's own close path.
    fn deliver(&self, frame: Frame) -> bool {
        let bytes = frame.len();
        match self.sender.try_send(frame) {
            Ok(()) => {
                counter!("glasses_cloud_frames_delivered_total", 1);
                counter!("glasses_cloud_bytes_delivered_total", bytes as u64);
                true
            }
            Err(TrySendError::Full(_)) => {
                counter!(
                    "glasses_cloud_flow_control_drops_total",
                    1,
                    "connection_id" => self.id.to_string()
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        let _ = self.sender.try_send(Frame::Close);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub glasses_connected: bool,
    pub active_apps: Vec<String>,
    pub loading_apps: Vec<String>,
    pub buffered_audio_frames: usize,
    pub is_transcribing: bool,
    pub transcript_entries: usize,
}

pub struct UserSession {
    session_id: String,
    user_id: String,
    me: Weak<UserSession>,
    state: Mutex<SessionState>,
}

struct SessionState {
    installed_apps: Vec<InstalledApp>,
    active_apps: BTreeSet<String>,
    loading_apps: BTreeSet<String>,
    apps: HashMap<String, AppSession>,
    glasses: Option<ConnectionHandle>,
    display: DisplayManager,
    audio: AudioPipeline,
    transcript: Vec<TranscriptionData>,
    disconnected_at: Option<Instant>,
    terminated: bool,
}

impl SessionState {
    fn notify_glasses(&self, message: &CloudToGlasses) {
        if let (Some(glasses), Some(frame)) = (&self.glasses, Frame::json(message)) {
            glasses.deliver(frame);
        }
    }

    fn notify_app_state(&self) {
        self.notify_glasses(&CloudToGlasses::AppStateChange(AppStateChange {
            active_app_package_names: self.active_apps.iter().cloned().collect(),
            loading_apps: self.loading_apps.iter().cloned().collect(),
        }));
    }

    fn blank_display(&self) {
        self.notify_glasses(&CloudToGlasses::DisplayEvent(DisplayRequest::new(
            Layout::blank(),
        )));
    }

    fn is_installed(&self, package_name: &str) -> bool {
        self.installed_apps
            .iter()
            .any(|app| app.package_name == package_name)
    }

    /// Runs stopping -> stopped in one step. Returns `false` if the app was
    /// not tracked.
    fn stop_app(&mut self, package_name: &str) -> bool {
        let Some(mut app) = self.apps.remove(package_name) else {
            return false;
        };
        app.state = AppState::Stopping;
        if let Some(connection) = app.connection.take() {
            connection.close();
        }
        app.subscriptions.clear();
        app.state = AppState::Stopped;

        self.active_apps.remove(package_name);
        self.loading_apps.remove(package_name);
        if self.display.handle_app_stop(package_name) {
            self.blank_display();
        }
        true
    }

    fn relay(&self, stream: StreamType, frame: &Frame) -> usize {
        let mut delivered = 0;
        for app in self.apps.values() {
            if !app.is_running() || !app.wants(stream) {
                continue;
            }
            if let Some(connection) = &app.connection {
                if connection.deliver(frame.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

impl UserSession {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        installed_apps: Vec<InstalledApp>,
        audio: &AudioSettings,
    ) -> Arc<Self> {
        let session_id = session_id.into();
        let audio = AudioPipeline::new(session_id.clone(), audio);
        Arc::new_cyclic(|me| Self {
            session_id,
            user_id: user_id.into(),
            me: me.clone(),
            state: Mutex::new(SessionState {
                installed_apps,
                active_apps: BTreeSet::new(),
                loading_apps: BTreeSet::new(),
                apps: HashMap::new(),
                glasses: None,
                display: DisplayManager::new(),
                audio,
                transcript: Vec::new(),
                disconnected_at: None,
                terminated: false,
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn glasses_connected(&self) -> bool {
        self.state.lock().glasses.is_some()
    }

    /// When the glasses connection was lost, if it currently is.
    pub fn disconnected_since(&self) -> Option<Instant> {
        self.state.lock().disconnected_at
    }

    pub fn installed_apps(&self) -> Vec<InstalledApp> {
        self.state.lock().installed_apps.clone()
    }

    pub fn active_apps(&self) -> Vec<String> {
        self.state.lock().active_apps.iter().cloned().collect()
    }

    /// Binds the glasses connection, replacing any previous one, and returns
    /// the ack to send on it.
    pub fn attach_glasses(
        &self,
        handle: ConnectionHandle,
    ) -> Result<GlassesConnectionAck, SessionError> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(SessionError::Terminated);
        }
        if let Some(previous) = state.glasses.replace(handle) {
            previous.close();
        }
        state.disconnected_at = None;
        info!(session_id = %self.session_id, user_id = %self.user_id, "glasses attached");
        Ok(GlassesConnectionAck {
            session_id: self.session_id.clone(),
            installed_apps: state.installed_apps.clone(),
            active_app_package_names: state.active_apps.iter().cloned().collect(),
        })
    }

    /// Releases the glasses connection if `connection_id` is still current and
    /// stamps the disconnect time for the reaper.
    pub fn detach_glasses(&self, connection_id: Uuid) -> bool {
        let mut state = self.state.lock();
        if state.glasses.as_ref().map(ConnectionHandle::id) != Some(connection_id) {
            return false;
        }
        state.glasses = None;
        state.disconnected_at = Some(Instant::now());
        info!(session_id = %self.session_id, "glasses detached; session awaiting reconnect");
        true
    }

    pub fn mark_disconnected(&self, at: Instant) {
        let mut state = self.state.lock();
        if let Some(glasses) = state.glasses.take() {
            glasses.close();
        }
        state.disconnected_at.get_or_insert(at);
    }

    pub fn on_app_start(&self, package_name: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(SessionError::Terminated);
        }
        if !state.is_installed(package_name) {
            return Err(SessionError::AppNotInstalled(package_name.to_string()));
        }
        if state.apps.contains_key(package_name) {
            debug!(session_id = %self.session_id, package = package_name, "app already started");
            return Ok(());
        }

        state
            .apps
            .insert(package_name.to_string(), AppSession::starting(package_name));
        state.loading_apps.insert(package_name.to_string());
        state.display.handle_app_start(package_name);
        state.notify_app_state();
        counter!("glasses_cloud_app_starts_total", 1, "package" => package_name.to_string());
        Ok(())
    }

    /// Returns `true` if the app was running or starting.
    pub fn on_app_stop(&self, package_name: &str) -> bool {
        let mut state = self.state.lock();
        let stopped = state.stop_app(package_name);
        if stopped {
            state.notify_app_state();
            info!(session_id = %self.session_id, package = package_name, "app stopped");
        }
        stopped
    }

    /// Binds a TPA connection. Starts the app if the glasses have not already
    /// done so. Returns the settings to put in the ack.
    pub fn attach_tpa(
        &self,
        package_name: &str,
        handle: ConnectionHandle,
        settings: AppSettings,
    ) -> Result<AppSettings, SessionError> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(SessionError::Terminated);
        }
        if !state.is_installed(package_name) {
            return Err(SessionError::AppNotInstalled(package_name.to_string()));
        }

        let app = state
            .apps
            .entry(package_name.to_string())
            .or_insert_with(|| AppSession::starting(package_name));
        if let Some(previous) = app.connection.replace(handle) {
            previous.close();
        }
        app.state = AppState::Running;
        app.settings = settings.clone();
        app.touch();

        state.loading_apps.remove(package_name);
        state.active_apps.insert(package_name.to_string());
        state.notify_app_state();
        info!(session_id = %self.session_id, package = package_name, "tpa attached");
        Ok(settings)
    }

    /// Stops the app if `connection_id` is still its live connection.
    pub fn detach_tpa(&self, package_name: &str, connection_id: Uuid) -> bool {
        let mut state = self.state.lock();
        let current = state
            .apps
            .get(package_name)
            .and_then(|app| app.connection.as_ref())
            .map(ConnectionHandle::id);
        if current != Some(connection_id) {
            return false;
        }
        state.stop_app(package_name);
        state.notify_app_state();
        info!(session_id = %self.session_id, package = package_name, "tpa detached");
        true
    }

    pub fn subscribe(&self, package_name: &str, stream: StreamType) -> Result<bool, SessionError> {
        let mut state = self.state.lock();
        let app = state
            .apps
            .get_mut(package_name)
            .ok_or_else(|| SessionError::AppNotRunning(package_name.to_string()))?;
        Ok(app.subscriptions.insert(stream))
    }

    pub fn unsubscribe(&self, package_name: &str, stream: StreamType) -> Result<bool, SessionError> {
        let mut state = self.state.lock();
        let app = state
            .apps
            .get_mut(package_name)
            .ok_or_else(|| SessionError::AppNotRunning(package_name.to_string()))?;
        Ok(app.subscriptions.remove(&stream))
    }

    /// Replaces the app's subscriptions with `streams`.
    pub fn update_subscriptions(
        &self,
        package_name: &str,
        streams: impl IntoIterator<Item = StreamType>,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let app = state
            .apps
            .get_mut(package_name)
            .ok_or_else(|| SessionError::AppNotRunning(package_name.to_string()))?;
        app.subscriptions = streams.into_iter().collect();
        app.touch();
        debug!(
            session_id = %self.session_id,
            package = package_name,
            subscriptions = app.subscriptions.len(),
            "subscriptions updated"
        );
        Ok(())
    }

    pub fn subscriptions(&self, package_name: &str) -> Vec<StreamType> {
        self.state
            .lock()
            .apps
            .get(package_name)
            .map(|app| app.subscriptions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fans a hardware event out as `data_stream`. Returns the number of apps
    /// it was queued for.
    pub fn relay_stream(&self, stream: StreamType, data: Value) -> usize {
        let Some(frame) = Frame::json(&CloudToTpa::DataStream(DataStream {
            stream_type: stream,
            data,
        })) else {
            return 0;
        };
        let delivered = self.state.lock().relay(stream, &frame);
        counter!(
            "glasses_cloud_stream_events_total",
            1,
            "stream" => stream.as_str()
        );
        delivered
    }

    pub fn handle_display_request(&self, package_name: &str, request: DisplayRequest) -> bool {
        let now = Instant::now();
        let (accepted, expiry) = {
            let mut state = self.state.lock();
            let open = !state.terminated
                && state.glasses.is_some()
                && state
                    .apps
                    .get(package_name)
                    .is_some_and(AppSession::is_running);
            if !state.display.handle_display_event(package_name, request, open, now) {
                return false;
            }
            let Some(active) = state.display.current(now).cloned() else {
                // A zero duration expires immediately.
                state.display.expire_due(now);
                state.blank_display();
                return true;
            };
            state.notify_glasses(&CloudToGlasses::DisplayEvent(active.request.clone()));
            if let Some(app) = state.apps.get_mut(package_name) {
                app.touch();
            }
            (true, active.expires_at.map(|at| (active.generation, at)))
        };

        if let Some((generation, deadline)) = expiry {
            self.schedule_display_expiry(generation, deadline);
        }
        counter!("glasses_cloud_display_requests_total", 1, "package" => package_name.to_string());
        accepted
    }

    /// The display currently on the glasses, if any.
    pub fn active_display(&self) -> Option<ActiveDisplay> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.display.expire_due(now) {
            state.blank_display();
        }
        state.display.current(now).cloned()
    }

    fn schedule_display_expiry(&self, generation: u64, deadline: Instant) {
        let session = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(session) = session.upgrade() {
                session.expire_display(generation);
            }
        });
    }

    fn expire_display(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.display.expire_generation(generation, Instant::now()) {
            debug!(session_id = %self.session_id, generation, "display expired");
            state.blank_display();
        }
    }

    /// Accepts a raw microphone frame, buffering it until a backend is ready.
    /// Also relays it to apps subscribed to `audio_chunk`.
    pub fn append_audio_frame(&self, frame: &[u8]) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        if let AppendOutcome::BackendFailed(err) = state.audio.append(frame) {
            warn!(session_id = %self.session_id, error = %err, "audio frame held after backend failure");
        }
        state.relay(StreamType::AudioChunk, &Frame::Binary(frame.to_vec()));
    }

    pub fn backend_ready(&self, backend: Box<dyn TranscriptionBackend>) -> usize {
        let mut state = self.state.lock();
        if state.terminated {
            let mut backend = backend;
            backend.close();
            return 0;
        }
        match state.audio.backend_ready(backend) {
            Ok(flushed) => flushed,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "backend failed while flushing");
                0
            }
        }
    }

    pub fn backend_failed(&self, reason: &str) {
        self.state.lock().audio.backend_failed(reason);
    }

    pub fn is_transcribing(&self) -> bool {
        self.state.lock().audio.is_transcribing()
    }

    pub fn buffered_audio_frames(&self) -> usize {
        self.state.lock().audio.buffered_frames()
    }

    /// Starts a backend in the background unless one is running or starting.
    pub fn start_transcription(&self, factory: Arc<dyn TranscriberFactory>) -> bool {
        if !self.state.lock().audio.begin_backend_init() {
            return false;
        }
        let Some(session) = self.me.upgrade() else {
            return false;
        };

        tokio::spawn(async move {
            let (events_tx, mut events) = mpsc::unbounded_channel();
            match factory.start(&session.session_id, events_tx).await {
                Ok(backend) => {
                    session.backend_ready(backend);
                }
                Err(err) => {
                    session.backend_failed(&err.to_string());
                    return;
                }
            }

            while let Some(event) = events.recv().await {
                match event {
                    TranscriptionEvent::Result(data) => session.handle_transcription(data),
                    TranscriptionEvent::Failed(reason) => {
                        session.backend_failed(&reason);
                        break;
                    }
                }
            }
        });
        true
    }

    /// Records a result and relays it to `transcription` subscribers. An
    /// interim result replaces a trailing interim one.
    pub fn handle_transcription(&self, data: TranscriptionData) {
        let value = match serde_json::to_value(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to encode transcription");
                return;
            }
        };
        {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            if state.transcript.last().is_some_and(|last| !last.is_final) {
                state.transcript.pop();
            }
            state.transcript.push(data);
        }
        self.relay_stream(StreamType::Transcription, value);
    }

    pub fn transcript(&self) -> Vec<TranscriptionData> {
        self.state.lock().transcript.clone()
    }

    /// Stops every app, closes the glasses and releases audio. Later calls
    /// are no-ops.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        state.terminated = true;
        let packages: Vec<String> = state.apps.keys().cloned().collect();
        for package in packages {
            state.stop_app(&package);
        }
        state.display.clear();
        state.audio.shutdown();
        if let Some(glasses) = state.glasses.take() {
            glasses.close();
        }
        info!(session_id = %self.session_id, user_id = %self.user_id, "session terminated");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            glasses_connected: state.glasses.is_some(),
            active_apps: state.active_apps.iter().cloned().collect(),
            loading_apps: state.loading_apps.iter().cloned().collect(),
            buffered_audio_frames: state.audio.buffered_frames(),
            is_transcribing: state.audio.is_transcribing(),
            transcript_entries: state.transcript.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glasses_protocol::{ButtonPress, CloudToGlasses, CloudToTpa, PressType};
    use std::time::Duration;

    fn app(package_name: &str) -> InstalledApp {
        InstalledApp {
            package_name: package_name.into(),
            name: package_name.into(),
            description: String::new(),
        }
    }

    fn session() -> Arc<UserSession> {
        UserSession::new(
            "session-1",
            "user-1",
            vec![app("org.example.a"), app("org.example.b")],
            &AudioSettings::default(),
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn glasses_messages(rx: &mut mpsc::Receiver<Frame>) -> Vec<CloudToGlasses> {
        drain(rx)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => glasses_protocol::decode(&text).ok(),
                _ => None,
            })
            .collect()
    }

    fn shown_text(message: &CloudToGlasses) -> Option<String> {
        match message {
            CloudToGlasses::DisplayEvent(request) => match &request.layout {
                Layout::TextWall { text } => Some(text.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn attach(session: &UserSession, package: &str) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        let (handle, rx) = ConnectionHandle::channel(16);
        session
            .attach_tpa(package, handle.clone(), AppSettings::default())
            .unwrap();
        (handle, rx)
    }

    #[test]
    fn starting_unknown_app_is_rejected() {
        let session = session();
        assert_eq!(
            session.on_app_start("org.example.missing"),
            Err(SessionError::AppNotInstalled("org.example.missing".into()))
        );
    }

    #[test]
    fn app_lifecycle_notifies_glasses() {
        let session = session();
        let (glasses, mut glasses_rx) = ConnectionHandle::channel(16);
        session.attach_glasses(glasses).unwrap();

        session.on_app_start("org.example.a").unwrap();
        let (_tpa, _tpa_rx) = attach(&session, "org.example.a");
        assert_eq!(session.active_apps(), vec!["org.example.a".to_string()]);

        let messages = glasses_messages(&mut glasses_rx);
        let states: Vec<(Vec<String>, Vec<String>)> = messages
            .into_iter()
            .filter_map(|message| match message {
                CloudToGlasses::AppStateChange(change) => {
                    Some((change.active_app_package_names, change.loading_apps))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                (vec![], vec!["org.example.a".to_string()]),
                (vec!["org.example.a".to_string()], vec![]),
            ]
        );
    }

    #[test]
    fn relay_reaches_only_subscribed_running_apps() {
        let session = session();
        let (_a, mut a_rx) = attach(&session, "org.example.a");
        let (_b, mut b_rx) = attach(&session, "org.example.b");
        session
            .update_subscriptions("org.example.a", [StreamType::ButtonPress])
            .unwrap();
        session.subscribe("org.example.b", StreamType::All).unwrap();
        session.on_app_start("org.example.b").unwrap();

        let press = ButtonPress {
            button_id: "main".into(),
            press_type: PressType::Long,
            timestamp: None,
        };
        let delivered =
            session.relay_stream(StreamType::ButtonPress, serde_json::to_value(&press).unwrap());
        assert_eq!(delivered, 2);
        assert_eq!(session.relay_stream(StreamType::HeadPosition, Value::Null), 1);

        let a_frames = drain(&mut a_rx);
        assert_eq!(a_frames.len(), 1);
        match &a_frames[0] {
            Frame::Text(text) => match glasses_protocol::decode::<CloudToTpa>(text).unwrap() {
                CloudToTpa::DataStream(stream) => {
                    assert_eq!(stream.stream_type, StreamType::ButtonPress)
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(drain(&mut b_rx).len(), 2);
    }

    #[test]
    fn stale_detach_keeps_replacement_connection() {
        let session = session();
        let (first, mut first_rx) = attach(&session, "org.example.a");
        let (second, _second_rx) = attach(&session, "org.example.a");

        assert_eq!(drain(&mut first_rx), vec![Frame::Close]);
        assert!(!session.detach_tpa("org.example.a", first.id()));
        assert_eq!(session.active_apps(), vec!["org.example.a".to_string()]);

        assert!(session.detach_tpa("org.example.a", second.id()));
        assert!(session.active_apps().is_empty());
        assert!(session.subscriptions("org.example.a").is_empty());
    }

    #[tokio::test]
    async fn stopping_owner_clears_display_and_blanks_glasses() {
        let session = session();
        let (glasses, mut glasses_rx) = ConnectionHandle::channel(32);
        session.attach_glasses(glasses).unwrap();
        let (_a, _a_rx) = attach(&session, "org.example.a");
        let (_b, _b_rx) = attach(&session, "org.example.b");

        let request = DisplayRequest::new(Layout::TextWall { text: "from a".into() });
        assert!(session.handle_display_request("org.example.a", request));
        assert!(!session.on_app_stop("org.example.missing"));
        assert!(session.on_app_stop("org.example.b"));
        assert!(session.active_display().is_some());

        assert!(session.on_app_stop("org.example.a"));
        assert!(session.active_display().is_none());

        let shown: Vec<String> = glasses_messages(&mut glasses_rx)
            .iter()
            .filter_map(shown_text)
            .collect();
        assert_eq!(shown, vec!["from a".to_string(), String::new()]);
    }

    #[tokio::test]
    async fn display_rejected_without_glasses() {
        let session = session();
        let request = DisplayRequest::new(Layout::TextLine { text: "hi".into() });
        assert!(!session.handle_display_request("org.example.a", request));
        assert!(session.active_display().is_none());
    }

    #[tokio::test]
    async fn stopped_app_cannot_take_over_display() {
        let session = session();
        let (glasses, mut glasses_rx) = ConnectionHandle::channel(32);
        session.attach_glasses(glasses).unwrap();
        let (_a, _a_rx) = attach(&session, "org.example.a");
        assert!(session.on_app_stop("org.example.a"));

        let request = DisplayRequest::new(Layout::TextWall { text: "late".into() });
        assert!(!session.handle_display_request("org.example.a", request));
        assert!(session.active_display().is_none());

        let request = DisplayRequest::new(Layout::TextWall { text: "never ran".into() });
        assert!(!session.handle_display_request("org.example.b", request));
        assert!(session.active_display().is_none());

        assert!(glasses_messages(&mut glasses_rx)
            .iter()
            .filter_map(shown_text)
            .all(|text| text.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_display_clears_after_duration() {
        let session = session();
        let (glasses, mut glasses_rx) = ConnectionHandle::channel(32);
        session.attach_glasses(glasses).unwrap();
        let (_a, _a_rx) = attach(&session, "org.example.a");

        let request = DisplayRequest::new(Layout::TextWall { text: "brief".into() })
            .with_duration_ms(Some(1000));
        assert!(session.handle_display_request("org.example.a", request));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(session.active_display().is_some());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(session.active_display().is_none());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let shown: Vec<String> = glasses_messages(&mut glasses_rx)
            .iter()
            .filter_map(shown_text)
            .collect();
        assert_eq!(shown, vec!["brief".to_string(), String::new()]);
    }

    #[test]
    fn interim_results_collapse_into_final() {
        let session = session();
        session.handle_transcription(TranscriptionData::interim("hel"));
        session.handle_transcription(TranscriptionData::interim("hello"));
        session.handle_transcription(TranscriptionData::final_result("hello there"));
        session.handle_transcription(TranscriptionData::interim("next"));

        let texts: Vec<String> = session
            .transcript()
            .into_iter()
            .map(|entry| entry.text)
            .collect();
        assert_eq!(texts, vec!["hello there".to_string(), "next".to_string()]);
    }

    #[test]
    fn terminate_is_idempotent_and_blocks_reattach() {
        let session = session();
        let (glasses, mut glasses_rx) = ConnectionHandle::channel(8);
        session.attach_glasses(glasses).unwrap();
        let (_a, mut a_rx) = attach(&session, "org.example.a");
        session.append_audio_frame(b"pcm");

        session.terminate();
        session.terminate();

        assert!(session.is_terminated());
        assert_eq!(session.buffered_audio_frames(), 0);
        assert!(drain(&mut a_rx).contains(&Frame::Close));
        assert!(drain(&mut glasses_rx).contains(&Frame::Close));
        let (again, _rx) = ConnectionHandle::channel(8);
        assert_eq!(session.attach_glasses(again), Err(SessionError::Terminated));
    }
}
