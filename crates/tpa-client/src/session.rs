//! Session connection manager.
//!
//! Phases move between `Disconnected`, `Connecting`, `Connected` and
//! `Reconnecting` under one mutex. Each opened link gets a new epoch; frames
//! and close notifications from an older epoch are ignored, which is how a
//! torn-down or superseded link is kept from touching the live state.

use std::sync::Arc;

use glasses_protocol::{
    AppSettings, CloudToTpa, ConnectionInit, StreamPayload, StreamType, SubscriptionUpdate,
    TpaToCloud, TranscriptionData,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::TpaSessionConfig,
    error::{TpaError, TpaResult},
    events::{EventManager, HandlerHandle, SessionEvent},
    layouts::{LayoutManager, MessageSink},
    subscriptions::SubscriptionRegistry,
    transport::{Connector, Inbound, WebSocketConnector},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// A TPA's live session with the cloud. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TpaSession {
    inner: Arc<Inner>,
}

struct Inner {
    config: TpaSessionConfig,
    connector: Arc<dyn Connector>,
    events: EventManager,
    subscriptions: Mutex<SubscriptionRegistry>,
    settings: RwLock<AppSettings>,
    state: Mutex<ConnectionState>,
    // Serializes handshakes so two attempts never race for one session id.
    connect_lock: tokio::sync::Mutex<()>,
}

struct ConnectionState {
    phase: ConnectionPhase,
    session_id: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    epoch: u64,
    reconnect_attempts: u32,
    cancel: CancellationToken,
    pending_ack: Option<oneshot::Sender<TpaResult<AppSettings>>>,
}

impl TpaSession {
    pub fn new(config: TpaSessionConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(config: TpaSessionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                events: EventManager::new(),
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                settings: RwLock::new(AppSettings::default()),
                state: Mutex::new(ConnectionState {
                    phase: ConnectionPhase::Disconnected,
                    session_id: None,
                    outbound: None,
                    epoch: 0,
                    reconnect_attempts: 0,
                    cancel: CancellationToken::new(),
                    pending_ack: None,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &TpaSessionConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventManager {
        &self.inner.events
    }

    pub fn layouts(&self) -> LayoutManager {
        let sink: Arc<dyn MessageSink> = self.inner.clone();
        LayoutManager::new(self.inner.config.package_name.clone(), sink)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    /// Settings most recently delivered by `connection_ack` or
    /// `settings_update`.
    pub fn settings(&self) -> AppSettings {
        self.inner.settings.read().clone()
    }

    pub fn subscriptions(&self) -> Vec<StreamType> {
        self.inner.subscriptions.lock().snapshot()
    }

    /// Opens the transport and completes the handshake for `session_id`.
    ///
    /// Any link or reconnect loop from an earlier call is dropped first. If
    /// the transport fails and auto-reconnect is enabled, a reconnect loop is
    /// started in the background even though this call returns the error.
    pub async fn connect(&self, session_id: impl Into<String>) -> TpaResult<()> {
        let session_id = session_id.into();
        let cancel = {
            let mut state = self.inner.state.lock();
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.epoch += 1;
            state.outbound = None;
            state.pending_ack = None;
            state.session_id = Some(session_id.clone());
            state.reconnect_attempts = 0;
            state.phase = ConnectionPhase::Connecting;
            state.cancel.clone()
        };

        info!(
            package = %self.inner.config.package_name,
            session_id = %session_id,
            "connecting to cloud"
        );

        match self.inner.establish(&session_id, &cancel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                {
                    let mut state = self.inner.state.lock();
                    if state.phase == ConnectionPhase::Connecting {
                        state.phase = ConnectionPhase::Disconnected;
                    }
                }
                if matches!(err, TpaError::Connection(_)) {
                    Inner::schedule_reconnect(&self.inner);
                }
                Err(err)
            }
        }
    }

    /// Closes the transport and forgets the session id and subscriptions.
    /// Safe to call repeatedly or while never connected; cancels any pending
    /// reconnect.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut state = self.inner.state.lock();
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.epoch += 1;
            state.outbound = None;
            state.pending_ack = None;
            state.session_id = None;
            state.reconnect_attempts = 0;
            let was_connected = state.phase == ConnectionPhase::Connected;
            state.phase = ConnectionPhase::Disconnected;
            was_connected
        };
        self.inner.subscriptions.lock().clear();

        if was_connected {
            info!(package = %self.inner.config.package_name, "disconnected from cloud");
            self.inner
                .events
                .emit(&SessionEvent::Disconnected("client disconnect".into()));
        }
    }

    /// Sends a frame if the transport is open. Never queues.
    pub fn send(&self, message: &TpaToCloud) -> TpaResult<()> {
        self.inner.send_frame(message)
    }

    /// Adds a stream subscription; pushes the full list if the transport is
    /// open, otherwise the list is sent after the next handshake.
    pub fn subscribe(&self, stream: StreamType) {
        self.inner.subscriptions.lock().add(stream);
        self.inner.push_subscriptions_if_open();
    }

    pub fn unsubscribe(&self, stream: StreamType) {
        self.inner.subscriptions.lock().remove(stream);
        self.inner.push_subscriptions_if_open();
    }

    pub fn on_transcription<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&TranscriptionData) + Send + Sync + 'static,
    {
        self.subscribe(StreamType::Transcription);
        self.inner.events.on_transcription(handler)
    }

    pub fn on_head_position<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&glasses_protocol::HeadPosition) + Send + Sync + 'static,
    {
        self.subscribe(StreamType::HeadPosition);
        self.inner.events.on_head_position(handler)
    }

    pub fn on_button_press<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&glasses_protocol::ButtonPress) + Send + Sync + 'static,
    {
        self.subscribe(StreamType::ButtonPress);
        self.inner.events.on_button_press(handler)
    }

    pub fn on_phone_notifications<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&glasses_protocol::PhoneNotification) + Send + Sync + 'static,
    {
        self.subscribe(StreamType::PhoneNotifications);
        self.inner.events.on_phone_notifications(handler)
    }

    pub fn on_translation<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&glasses_protocol::TranslationData) + Send + Sync + 'static,
    {
        self.subscribe(StreamType::Translation);
        self.inner.events.on_translation(handler)
    }

    pub fn on_glasses_battery<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&glasses_protocol::BatteryUpdate) + Send + Sync + 'static,
    {
        self.subscribe(StreamType::GlassesBatteryUpdate);
        self.inner.events.on_glasses_battery(handler)
    }

    pub fn on_location<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&glasses_protocol::LocationUpdate) + Send + Sync + 'static,
    {
        self.subscribe(StreamType::LocationUpdate);
        self.inner.events.on_location(handler)
    }

    /// Generic subscription: subscribes to `stream` and routes its payloads.
    pub fn on_stream<F>(&self, stream: StreamType, handler: F) -> HandlerHandle
    where
        F: Fn(&StreamPayload) + Send + Sync + 'static,
    {
        self.subscribe(stream);
        self.inner.events.on_stream(stream, handler)
    }
}

impl Inner {
    async fn establish(self: &Arc<Self>, session_id: &str, cancel: &CancellationToken) -> TpaResult<()> {
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(TpaError::Cancelled),
            guard = self.connect_lock.lock() => guard,
        };

        let url = self.config.endpoint();
        let link = tokio::select! {
            _ = cancel.cancelled() => return Err(TpaError::Cancelled),
            result = self.connector.connect(&url) => result?,
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let outbound = link.outbound.clone();
        let epoch = {
            let mut state = self.state.lock();
            if cancel.is_cancelled() {
                return Err(TpaError::Cancelled);
            }
            state.epoch += 1;
            state.outbound = Some(link.outbound);
            state.pending_ack = Some(ack_tx);
            state.epoch
        };
        tokio::spawn(Inner::read_loop(Arc::clone(self), epoch, link.inbound));

        let init = TpaToCloud::ConnectionInit(ConnectionInit::new(
            session_id,
            self.config.package_name.clone(),
            self.config.api_key.clone(),
        ));
        let text = glasses_protocol::encode(&init).map_err(|err| TpaError::Encode(err.to_string()))?;
        if outbound.send(text).is_err() {
            self.abandon(epoch);
            return Err(TpaError::Connection("transport closed before handshake".into()));
        }
        drop(outbound);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(TpaError::Cancelled),
            result = tokio::time::timeout(self.config.handshake_timeout, ack_rx) => match result {
                Ok(Ok(ack)) => ack.map(|_| ()),
                Ok(Err(_)) => Err(TpaError::Connection("handshake abandoned".into())),
                Err(_) => Err(TpaError::Timeout),
            },
        };

        if let Err(err) = &outcome {
            warn!(
                package = %self.config.package_name,
                session_id = %session_id,
                error = %err,
                "handshake failed"
            );
            self.abandon(epoch);
        }
        outcome
    }

    /// Drops the link opened for `epoch` without running the close path.
    fn abandon(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.epoch += 1;
            state.outbound = None;
            state.pending_ack = None;
        }
    }

    async fn read_loop(self: Arc<Self>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(event) = inbound.recv().await {
            if self.state.lock().epoch != epoch {
                return;
            }
            match event {
                Inbound::Text(text) => self.handle_frame(epoch, &text),
                Inbound::Closed { reason } => {
                    self.handle_close(epoch, reason);
                    return;
                }
            }
        }
        self.handle_close(epoch, None);
    }

    fn handle_frame(&self, epoch: u64, text: &str) {
        let message = match glasses_protocol::decode::<CloudToTpa>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "failed to parse message from cloud");
                self.events
                    .emit(&SessionEvent::Error(TpaError::Decode(err.to_string())));
                return;
            }
        };

        match message {
            CloudToTpa::ConnectionAck(ack) => {
                let pending = {
                    let mut state = self.state.lock();
                    if state.epoch != epoch {
                        return;
                    }
                    state.phase = ConnectionPhase::Connected;
                    state.reconnect_attempts = 0;
                    state.pending_ack.take()
                };
                *self.settings.write() = ack.settings.clone();
                info!(package = %self.config.package_name, "connection acknowledged");
                if let Some(pending) = pending {
                    let _ = pending.send(Ok(ack.settings.clone()));
                }
                self.events.emit(&SessionEvent::Connected(ack.settings));
                // The cloud lost our subscriptions along with the old link.
                if let Err(err) = self.push_subscriptions() {
                    warn!(error = %err, "failed to resync subscriptions");
                }
            }
            CloudToTpa::ConnectionError(error) => {
                let pending = self.state.lock().pending_ack.take();
                if let Some(pending) = pending {
                    let _ = pending.send(Err(TpaError::Rejected(error.message.clone())));
                }
                self.events
                    .emit(&SessionEvent::Error(TpaError::Rejected(error.message)));
            }
            CloudToTpa::DataStream(frame) => {
                let stream = frame.stream_type;
                match StreamPayload::decode(stream, frame.data) {
                    Ok(payload) => {
                        self.events.emit(&SessionEvent::Stream { stream, payload });
                    }
                    Err(err) => {
                        warn!(stream = %stream, error = %err, "stream payload did not match its type");
                        self.events
                            .emit(&SessionEvent::Error(TpaError::Decode(err.to_string())));
                    }
                }
            }
            CloudToTpa::SettingsUpdate(update) => {
                *self.settings.write() = update.settings.clone();
                self.events
                    .emit(&SessionEvent::SettingsUpdate(update.settings));
            }
        }
    }

    fn handle_close(self: &Arc<Self>, epoch: u64, reason: Option<String>) {
        let (pending, was_connected) = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.epoch += 1;
            state.outbound = None;
            let was_connected = state.phase == ConnectionPhase::Connected;
            if was_connected {
                state.phase = ConnectionPhase::Disconnected;
            }
            (state.pending_ack.take(), was_connected)
        };

        let reason = reason.unwrap_or_else(|| "connection closed".into());
        if let Some(pending) = pending {
            // Mid-handshake: the waiting attempt decides what happens next.
            let _ = pending.send(Err(TpaError::Connection(reason)));
            return;
        }

        if was_connected {
            info!(package = %self.config.package_name, reason = %reason, "connection closed");
            self.events.emit(&SessionEvent::Disconnected(reason));
            Inner::schedule_reconnect(self);
        }
    }

    fn schedule_reconnect(inner: &Arc<Self>) {
        let cancel = {
            let mut state = inner.state.lock();
            if !inner.config.auto_reconnect
                || state.session_id.is_none()
                || state.phase == ConnectionPhase::Reconnecting
                || state.cancel.is_cancelled()
            {
                return;
            }
            state.phase = ConnectionPhase::Reconnecting;
            state.cancel.clone()
        };
        tokio::spawn(Inner::reconnect_loop(Arc::clone(inner), cancel));
    }

    async fn reconnect_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let (attempt, session_id) = {
                let mut state = self.state.lock();
                if cancel.is_cancelled() {
                    return;
                }
                let Some(session_id) = state.session_id.clone() else {
                    return;
                };
                if state.reconnect_attempts >= self.config.max_reconnect_attempts {
                    let attempts = state.reconnect_attempts;
                    state.phase = ConnectionPhase::Disconnected;
                    drop(state);
                    warn!(
                        package = %self.config.package_name,
                        attempts,
                        "giving up on reconnection"
                    );
                    self.events
                        .emit(&SessionEvent::Error(TpaError::ReconnectExhausted { attempts }));
                    return;
                }
                let attempt = state.reconnect_attempts;
                state.reconnect_attempts += 1;
                (attempt, session_id)
            };

            let delay = self.config.backoff_delay(attempt);
            info!(
                package = %self.config.package_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish(&session_id, &cancel).await {
                Ok(()) => {
                    info!(package = %self.config.package_name, "reconnected");
                    return;
                }
                Err(TpaError::Cancelled) => return,
                Err(err) => {
                    debug!(error = %err, "reconnect attempt failed");
                    self.events.emit(&SessionEvent::Error(err));
                }
            }
        }
    }

    fn send_frame(&self, message: &TpaToCloud) -> TpaResult<()> {
        let outbound = self
            .state
            .lock()
            .outbound
            .clone()
            .ok_or(TpaError::NotConnected)?;
        let text =
            glasses_protocol::encode(message).map_err(|err| TpaError::Encode(err.to_string()))?;
        outbound.send(text).map_err(|_| TpaError::NotConnected)
    }

    fn is_open(&self) -> bool {
        self.state
            .lock()
            .outbound
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    fn push_subscriptions(&self) -> TpaResult<()> {
        let subscriptions = self.subscriptions.lock().snapshot();
        debug!(count = subscriptions.len(), "pushing subscription list");
        self.send_frame(&TpaToCloud::SubscriptionUpdate(SubscriptionUpdate {
            package_name: self.config.package_name.clone(),
            subscriptions,
        }))
    }

    fn push_subscriptions_if_open(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(err) = self.push_subscriptions() {
            debug!(error = %err, "subscription push skipped; resync follows the next handshake");
        }
    }
}

impl MessageSink for Inner {
    fn send(&self, message: &TpaToCloud) -> TpaResult<()> {
        self.send_frame(message)
    }
}
