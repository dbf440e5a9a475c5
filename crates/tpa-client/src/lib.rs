//! Client side of the third-party app (TPA) session protocol.
//!
//! A [`TpaSession`] owns one connection to the glasses cloud. It performs the
//! `connection_init` / `connection_ack` handshake, keeps the cloud's view of
//! the app's stream subscriptions in sync across reconnects, fans inbound
//! frames out to registered handlers and exposes a [`LayoutManager`] for
//! display requests.
//!
//! ```no_run
//! use tpa_client::{TpaSession, TpaSessionConfig};
//!
//! # async fn run() -> Result<(), tpa_client::TpaError> {
//! let session = TpaSession::new(TpaSessionConfig::new("org.example.captions", "api-key"));
//! let layouts = session.layouts();
//! let _handle = session.on_transcription(move |data| {
//!     let _ = layouts.show_text_wall(data.text.clone(), None);
//! });
//! session.connect("session-123").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod layouts;
pub mod session;
pub mod subscriptions;
pub mod transport;

pub use config::TpaSessionConfig;
pub use error::{TpaError, TpaResult};
pub use events::{EventManager, EventName, HandlerHandle, SessionEvent};
pub use layouts::{LayoutManager, MessageSink};
pub use session::{ConnectionPhase, TpaSession};
pub use subscriptions::SubscriptionRegistry;
pub use transport::{Connector, Inbound, Link, WebSocketConnector};

pub use glasses_protocol::{Layout, StreamPayload, StreamType};
