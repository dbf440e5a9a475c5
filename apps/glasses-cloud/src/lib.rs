//! Cloud side of the smart-glasses platform: one [`UserSession`] per
//! connected device, fan-out of hardware events to subscribed third-party
//! apps, single-display arbitration and buffered audio for transcription.

pub mod apps;
pub mod audio;
pub mod auth;
pub mod config;
pub mod display;
pub mod dynamics;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod transcription;
pub mod user_session;
pub mod ws;

pub use registry::{SessionConfig, SessionRegistry};
pub use server::{router, run, AppState};
pub use user_session::{ConnectionHandle, Frame, SessionError, UserSession};
