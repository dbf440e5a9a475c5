//! Frames exchanged between a third-party app and the cloud over `/tpa-ws`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{layout::DisplayRequest, stream::StreamType};

/// First frame a TPA sends after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInit {
    pub session_id: String,
    pub package_name: String,
    pub api_key: String,
}

impl ConnectionInit {
    pub fn new(
        session_id: impl Into<String>,
        package_name: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            package_name: package_name.into(),
            api_key: api_key.into(),
        }
    }
}

/// Always the complete subscription set, never a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdate {
    pub package_name: String,
    pub subscriptions: Vec<StreamType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TpaToCloud {
    #[serde(alias = "tpa_connection_init")]
    ConnectionInit(ConnectionInit),
    SubscriptionUpdate(SubscriptionUpdate),
    DisplayEvent(DisplayRequest),
}

/// A single app setting as stored by the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSetting {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppSettings(pub Vec<AppSetting>);

impl AppSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|setting| setting.key == key)
            .map(|setting| &setting.value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAck {
    #[serde(default)]
    pub settings: AppSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionError {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStream {
    pub stream_type: StreamType,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub settings: AppSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CloudToTpa {
    #[serde(alias = "tpa_connection_ack")]
    ConnectionAck(ConnectionAck),
    #[serde(alias = "tpa_connection_error")]
    ConnectionError(ConnectionError),
    DataStream(DataStream),
    SettingsUpdate(SettingsUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_init_uses_camel_case_fields() {
        let frame = TpaToCloud::ConnectionInit(ConnectionInit::new(
            "session-1",
            "org.example.notes",
            "key-123",
        ));
        let wire = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            wire,
            json!({
                "type": "connection_init",
                "sessionId": "session-1",
                "packageName": "org.example.notes",
                "apiKey": "key-123"
            })
        );
    }

    #[test]
    fn accepts_legacy_tpa_prefixed_handshake() {
        let frame: TpaToCloud = serde_json::from_value(json!({
            "type": "tpa_connection_init",
            "sessionId": "s",
            "packageName": "p",
            "apiKey": "k"
        }))
        .expect("decode");
        assert!(matches!(frame, TpaToCloud::ConnectionInit(init) if init.package_name == "p"));
    }

    #[test]
    fn settings_lookup_by_key() {
        let ack: CloudToTpa = serde_json::from_value(json!({
            "type": "connection_ack",
            "settings": [{"key": "lineWidth", "value": 30}]
        }))
        .expect("decode");
        let CloudToTpa::ConnectionAck(ack) = ack else {
            panic!("expected ack");
        };
        assert_eq!(ack.settings.get("lineWidth"), Some(&json!(30)));
        assert!(ack.settings.get("missing").is_none());
    }
}
