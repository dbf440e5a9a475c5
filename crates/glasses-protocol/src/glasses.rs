//! Frames exchanged between the glasses (via the companion phone) and the cloud
//! over `/glasses-ws`. Binary frames on that socket carry raw audio and are not
//! modelled here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    layout::DisplayRequest,
    stream::{BatteryUpdate, ButtonPress, HeadPosition, LocationUpdate, PhoneNotification, StreamType},
    tpa::ConnectionError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlassesConnectionInit {
    pub user_id: String,
    /// Present when the device resumes a session after a dropped socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppLifecycle {
    pub package_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GlassesToCloud {
    ConnectionInit(GlassesConnectionInit),
    StartApp(AppLifecycle),
    StopApp(AppLifecycle),
    ButtonPress(ButtonPress),
    HeadPosition(HeadPosition),
    PhoneNotification(PhoneNotification),
    GlassesBatteryUpdate(BatteryUpdate),
    PhoneBatteryUpdate(BatteryUpdate),
    LocationUpdate(LocationUpdate),
}

impl GlassesToCloud {
    /// Maps hardware events to the stream they are fanned out on. Control
    /// frames return `None`.
    pub fn into_stream_event(self) -> Result<Option<(StreamType, Value)>, serde_json::Error> {
        let event = match self {
            GlassesToCloud::ButtonPress(data) => (StreamType::ButtonPress, serde_json::to_value(data)?),
            GlassesToCloud::HeadPosition(data) => {
                (StreamType::HeadPosition, serde_json::to_value(data)?)
            }
            GlassesToCloud::PhoneNotification(data) => {
                (StreamType::PhoneNotifications, serde_json::to_value(data)?)
            }
            GlassesToCloud::GlassesBatteryUpdate(data) => {
                (StreamType::GlassesBatteryUpdate, serde_json::to_value(data)?)
            }
            GlassesToCloud::PhoneBatteryUpdate(data) => {
                (StreamType::PhoneBatteryUpdate, serde_json::to_value(data)?)
            }
            GlassesToCloud::LocationUpdate(data) => {
                (StreamType::LocationUpdate, serde_json::to_value(data)?)
            }
            GlassesToCloud::ConnectionInit(_)
            | GlassesToCloud::StartApp(_)
            | GlassesToCloud::StopApp(_) => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub package_name: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlassesConnectionAck {
    pub session_id: String,
    pub installed_apps: Vec<InstalledApp>,
    pub active_app_package_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateChange {
    pub active_app_package_names: Vec<String>,
    pub loading_apps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CloudToGlasses {
    ConnectionAck(GlassesConnectionAck),
    ConnectionError(ConnectionError),
    AppStateChange(AppStateChange),
    DisplayEvent(DisplayRequest),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phone_notification_maps_to_plural_stream() {
        let frame: GlassesToCloud = serde_json::from_value(json!({
            "type": "phone_notification",
            "notificationId": "n-1",
            "app": "Messages",
            "title": "Ana",
            "content": "Running late",
            "priority": "high",
            "timestamp": 1700000000000u64
        }))
        .expect("decode");

        let (stream, data) = frame
            .into_stream_event()
            .expect("encode")
            .expect("hardware event");
        assert_eq!(stream, StreamType::PhoneNotifications);
        assert_eq!(data["title"], "Ana");
    }

    #[test]
    fn lifecycle_frames_are_not_streams() {
        let frame: GlassesToCloud = serde_json::from_value(json!({
            "type": "start_app",
            "packageName": "org.example.captions"
        }))
        .expect("decode");
        assert!(frame.into_stream_event().expect("no encode error").is_none());
    }
}
