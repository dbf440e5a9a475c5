//! WebSocket endpoints for the glasses (`/glasses-ws`) and TPAs (`/tpa-ws`).
//!
//! Each socket is split into a reader loop running here and a writer task fed
//! by the connection's bounded [`Frame`] channel. The first inbound frame must
//! be `connection_init`; the ack is written before the writer starts so it
//! always precedes relayed traffic.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use glasses_protocol::{
    CloudToGlasses, CloudToTpa, ConnectionAck, ConnectionError, GlassesConnectionInit,
    GlassesToCloud, TpaToCloud,
};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::AuthError,
    server::AppState,
    user_session::{ConnectionHandle, Frame, SessionError, UserSession},
};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("socket closed during handshake: {0:?}")]
    Closed(Option<String>),
    #[error("client sent invalid payload: {0}")]
    InvalidPayload(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unexpected frame type")]
    UnexpectedFrame,
    #[error("client closed socket before handshake")]
    SocketClosed,
    #[error("expected connection_init")]
    NotInit,
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl HandshakeError {
    fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::Closed(_) => "client_closed",
            HandshakeError::InvalidPayload(_) => "invalid_payload",
            HandshakeError::Protocol(_) => "protocol_error",
            HandshakeError::UnexpectedFrame => "unexpected_frame",
            HandshakeError::SocketClosed => "socket_closed",
            HandshakeError::NotInit => "not_init",
            HandshakeError::Unauthorized(err) => err.metric_label(),
            HandshakeError::UnknownSession(_) => "unknown_session",
            HandshakeError::Session(_) => "session_error",
        }
    }

    /// Whether the peer is still there to read a `connection_error`.
    fn peer_listening(&self) -> bool {
        !matches!(
            self,
            HandshakeError::Closed(_) | HandshakeError::SocketClosed | HandshakeError::Protocol(_)
        )
    }
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub async fn glasses_ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = glasses_connection(socket, state).await {
            warn!("glasses connection ended with error: {err:?}");
        }
    })
}

pub async fn tpa_ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = tpa_connection(socket, state).await {
            warn!("tpa connection ended with error: {err:?}");
        }
    })
}

async fn glasses_connection(socket: WebSocket, state: Arc<AppState>) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let handshake_started = Instant::now();
    let init = match read_init::<GlassesToCloud>(state.handshake_timeout, &mut ws_rx).await {
        Ok(GlassesToCloud::ConnectionInit(init)) => init,
        Ok(_) => return reject_glasses(&mut ws_tx, HandshakeError::NotInit).await,
        Err(err) => return reject_glasses(&mut ws_tx, err).await,
    };

    let session = open_user_session(&state, &init);
    let (handle, rx) = ConnectionHandle::channel(state.registry.config().per_connection_buffer);
    let connection_id = handle.id();
    let ack = match session.attach_glasses(handle) {
        Ok(ack) => ack,
        Err(err) => return reject_glasses(&mut ws_tx, err.into()).await,
    };
    if let Err(err) = send_json(&mut ws_tx, &CloudToGlasses::ConnectionAck(ack)).await {
        session.detach_glasses(connection_id);
        return Err(err.into());
    }
    record_handshake_success("glasses", handshake_started.elapsed());
    session.start_transcription(Arc::clone(&state.transcriber));

    info!(
        session_id = %session.session_id(),
        user_id = %init.user_id,
        connection_id = %connection_id,
        "glasses connection established"
    );

    let writer = spawn_writer(ws_tx, rx);
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => handle_glasses_frame(&session, &text),
            Ok(Message::Binary(bytes)) => session.append_audio_frame(&bytes),
            Ok(Message::Close(frame)) => {
                info!(
                    session_id = %session.session_id(),
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "glasses closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    session_id = %session.session_id(),
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving glasses message"
                );
                break;
            }
        }
    }

    session.detach_glasses(connection_id);
    writer.abort();
    counter!("glasses_cloud_connections_closed_total", 1, "client" => "glasses");
    info!(
        session_id = %session.session_id(),
        connection_id = %connection_id,
        "glasses connection closed"
    );
    Ok(())
}

fn open_user_session(state: &AppState, init: &GlassesConnectionInit) -> Arc<UserSession> {
    if let Some(session) = init
        .session_id
        .as_deref()
        .and_then(|id| state.registry.resume(id, &init.user_id))
    {
        info!(session_id = %session.session_id(), "resuming user session");
        return session;
    }
    state
        .registry
        .create(&init.user_id, state.apps.installed_apps(&init.user_id))
}

fn handle_glasses_frame(session: &UserSession, text: &str) {
    let message = match glasses_protocol::decode::<GlassesToCloud>(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(session_id = %session.session_id(), error = %err, "malformed glasses frame");
            counter!("glasses_cloud_malformed_frames_total", 1, "client" => "glasses");
            return;
        }
    };

    match message {
        GlassesToCloud::ConnectionInit(_) => {
            debug!(session_id = %session.session_id(), "ignoring repeated connection_init");
        }
        GlassesToCloud::StartApp(app) => {
            if let Err(err) = session.on_app_start(&app.package_name) {
                warn!(
                    session_id = %session.session_id(),
                    package = %app.package_name,
                    error = %err,
                    "start_app rejected"
                );
            }
        }
        GlassesToCloud::StopApp(app) => {
            session.on_app_stop(&app.package_name);
        }
        event => match event.into_stream_event() {
            Ok(Some((stream, data))) => {
                session.relay_stream(stream, data);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to encode stream event"),
        },
    }
}

async fn reject_glasses(ws_tx: &mut WsSink, err: HandshakeError) -> Result<()> {
    record_handshake_failure("glasses", &err);
    if err.peer_listening() {
        let message = CloudToGlasses::ConnectionError(ConnectionError {
            message: err.to_string(),
        });
        let _ = send_json(ws_tx, &message).await;
        let _ = ws_tx.send(Message::Close(None)).await;
    }
    Err(err.into())
}

struct TpaAttachment {
    session: Arc<UserSession>,
    package_name: String,
    connection_id: Uuid,
    receiver: mpsc::Receiver<Frame>,
    ack: ConnectionAck,
}

async fn tpa_connection(socket: WebSocket, state: Arc<AppState>) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let handshake_started = Instant::now();
    let attachment = match tpa_handshake(&state, &mut ws_rx).await {
        Ok(attachment) => attachment,
        Err(err) => {
            record_handshake_failure("tpa", &err);
            if err.peer_listening() {
                let message = CloudToTpa::ConnectionError(ConnectionError {
                    message: err.to_string(),
                });
                let _ = send_json(&mut ws_tx, &message).await;
                let _ = ws_tx.send(Message::Close(None)).await;
            }
            return Err(err.into());
        }
    };
    let TpaAttachment {
        session,
        package_name,
        connection_id,
        receiver,
        ack,
    } = attachment;

    if let Err(err) = send_json(&mut ws_tx, &CloudToTpa::ConnectionAck(ack)).await {
        session.detach_tpa(&package_name, connection_id);
        return Err(err.into());
    }
    record_handshake_success("tpa", handshake_started.elapsed());
    info!(
        session_id = %session.session_id(),
        package = %package_name,
        connection_id = %connection_id,
        "tpa connection established"
    );

    let writer = spawn_writer(ws_tx, receiver);
    while let Some(message) = ws_rx.next().await {
        let decoded = match message {
            Ok(Message::Text(text)) => glasses_protocol::decode::<TpaToCloud>(&text),
            Ok(Message::Binary(bytes)) => glasses_protocol::decode_slice::<TpaToCloud>(&bytes),
            Ok(Message::Close(frame)) => {
                info!(
                    session_id = %session.session_id(),
                    package = %package_name,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "tpa closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    session_id = %session.session_id(),
                    package = %package_name,
                    error = %err,
                    "error receiving tpa message"
                );
                break;
            }
        };

        match decoded {
            Ok(message) => handle_tpa_message(&session, &package_name, message),
            Err(err) => {
                warn!(package = %package_name, error = %err, "malformed tpa frame");
                counter!("glasses_cloud_malformed_frames_total", 1, "client" => "tpa");
            }
        }
    }

    session.detach_tpa(&package_name, connection_id);
    writer.abort();
    counter!("glasses_cloud_connections_closed_total", 1, "client" => "tpa");
    info!(
        session_id = %session.session_id(),
        package = %package_name,
        connection_id = %connection_id,
        "tpa connection closed"
    );
    Ok(())
}

async fn tpa_handshake(
    state: &AppState,
    ws_rx: &mut WsStream,
) -> Result<TpaAttachment, HandshakeError> {
    let init = match read_init::<TpaToCloud>(state.handshake_timeout, ws_rx).await? {
        TpaToCloud::ConnectionInit(init) => init,
        _ => return Err(HandshakeError::NotInit),
    };

    state.validator.validate(&init.package_name, &init.api_key)?;
    let session = state
        .registry
        .get(&init.session_id)
        .ok_or_else(|| HandshakeError::UnknownSession(init.session_id.clone()))?;

    let (handle, receiver) =
        ConnectionHandle::channel(state.registry.config().per_connection_buffer);
    let connection_id = handle.id();
    let settings = state.apps.settings(session.user_id(), &init.package_name);
    let settings = session.attach_tpa(&init.package_name, handle, settings)?;

    Ok(TpaAttachment {
        session,
        package_name: init.package_name,
        connection_id,
        receiver,
        ack: ConnectionAck { settings },
    })
}

fn handle_tpa_message(session: &UserSession, package_name: &str, message: TpaToCloud) {
    match message {
        TpaToCloud::SubscriptionUpdate(update) => {
            if update.package_name != package_name {
                debug!(
                    claimed = %update.package_name,
                    package = package_name,
                    "subscription_update package overridden by connection"
                );
            }
            if let Err(err) = session.update_subscriptions(package_name, update.subscriptions) {
                warn!(package = package_name, error = %err, "subscription update rejected");
            }
        }
        TpaToCloud::DisplayEvent(request) => {
            if !session.handle_display_request(package_name, request) {
                debug!(package = package_name, "display request rejected");
            }
        }
        TpaToCloud::ConnectionInit(_) => {
            debug!(package = package_name, "ignoring repeated connection_init");
        }
    }
}

async fn read_init<T: DeserializeOwned>(
    handshake_timeout: Duration,
    ws_rx: &mut WsStream,
) -> Result<T, HandshakeError> {
    let first = timeout(handshake_timeout, ws_rx.next())
        .await
        .map_err(|_| HandshakeError::TimedOut)?
        .ok_or(HandshakeError::SocketClosed)?;

    match first.map_err(|err| HandshakeError::Protocol(err.to_string()))? {
        Message::Text(text) => glasses_protocol::decode::<T>(&text)
            .map_err(|err| HandshakeError::InvalidPayload(err.to_string())),
        Message::Binary(bytes) => glasses_protocol::decode_slice::<T>(&bytes)
            .map_err(|err| HandshakeError::InvalidPayload(err.to_string())),
        Message::Close(frame) => Err(HandshakeError::Closed(frame.map(|f| f.reason.to_string()))),
        _ => Err(HandshakeError::UnexpectedFrame),
    }
}

async fn send_json<T: Serialize>(ws_tx: &mut WsSink, message: &T) -> Result<(), HandshakeError> {
    let payload =
        glasses_protocol::encode(message).map_err(|err| HandshakeError::Protocol(err.to_string()))?;
    ws_tx
        .send(Message::Text(payload))
        .await
        .map_err(|err| HandshakeError::Protocol(err.to_string()))
}

fn spawn_writer(mut ws_tx: WsSink, mut rx: mpsc::Receiver<Frame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(bytes) => Message::Binary(bytes),
                Frame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    })
}

fn record_handshake_success(client: &'static str, duration: Duration) {
    counter!("glasses_cloud_handshakes_success_total", 1, "client" => client);
    histogram!(
        "glasses_cloud_handshake_duration_ms",
        duration.as_secs_f64() * 1000.0,
        "client" => client
    );
}

fn record_handshake_failure(client: &'static str, error: &HandshakeError) {
    warn!(client, reason = error.metric_label(), error = %error, "handshake failed");
    counter!(
        "glasses_cloud_handshakes_failure_total",
        1,
        "client" => client,
        "reason" => error.metric_label()
    );
}
