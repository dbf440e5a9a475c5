//! Message shapes exchanged between the glasses cloud, the glasses client and
//! third-party apps (TPAs). Both the cloud and the TPA client crate depend on
//! these types so the wire format lives in exactly one place.
//!
//! Every frame is a JSON object tagged by `type` with camelCase fields.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod glasses;
pub mod layout;
pub mod stream;
pub mod tpa;

pub use glasses::{
    AppLifecycle, AppStateChange, CloudToGlasses, GlassesConnectionAck, GlassesConnectionInit,
    GlassesToCloud, InstalledApp,
};
pub use layout::{DisplayRequest, Layout, LayoutType};
pub use stream::{
    BatteryUpdate, ButtonPress, HeadPosition, HeadPositionKind, LocationUpdate,
    PhoneNotification, PressType, StreamPayload, StreamType, TranscriptionData, TranslationData,
};
pub use tpa::{
    AppSetting, AppSettings, CloudToTpa, ConnectionAck, ConnectionError, ConnectionInit,
    DataStream, SettingsUpdate, SubscriptionUpdate, TpaToCloud,
};

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Serializes a message into a text frame.
pub fn encode<T: Serialize>(message: &T) -> ProtocolResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes a text frame into a typed message.
pub fn decode<T: DeserializeOwned>(text: &str) -> ProtocolResult<T> {
    Ok(serde_json::from_str(text)?)
}

/// Decodes a binary frame that carries JSON.
pub fn decode_slice<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_wall_display_event_round_trips() {
        let message = TpaToCloud::DisplayEvent(DisplayRequest {
            layout: Layout::TextWall {
                text: "hello glasses".into(),
            },
            duration_ms: Some(1500),
            package_name: Some("org.example.captions".into()),
        });

        let wire = encode(&message).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&wire).expect("json");
        assert_eq!(value["type"], "display_event");
        assert_eq!(value["layout"]["layoutType"], "text_wall");
        assert_eq!(value["durationMs"], 1500);

        let decoded: TpaToCloud = decode(&wire).expect("decode");
        match decoded {
            TpaToCloud::DisplayEvent(request) => {
                assert_eq!(request.layout.layout_type(), LayoutType::TextWall);
                assert_eq!(
                    request.layout,
                    Layout::TextWall {
                        text: "hello glasses".into()
                    }
                );
                assert_eq!(request.package_name.as_deref(), Some("org.example.captions"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_surface_as_errors() {
        let err = decode::<CloudToTpa>("{\"type\":\"data_stream\"").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(decode::<CloudToTpa>("{\"type\":\"no_such_message\"}").is_err());
    }
}
