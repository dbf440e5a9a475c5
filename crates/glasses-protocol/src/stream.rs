use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of event or data a TPA can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    ButtonPress,
    HeadPosition,
    PhoneNotifications,
    Transcription,
    Translation,
    GlassesBatteryUpdate,
    PhoneBatteryUpdate,
    LocationUpdate,
    OpenDashboard,
    AudioChunk,
    Video,
    All,
    #[serde(rename = "*")]
    Wildcard,
}

impl StreamType {
    pub const ALL_TYPES: [StreamType; 13] = [
        StreamType::ButtonPress,
        StreamType::HeadPosition,
        StreamType::PhoneNotifications,
        StreamType::Transcription,
        StreamType::Translation,
        StreamType::GlassesBatteryUpdate,
        StreamType::PhoneBatteryUpdate,
        StreamType::LocationUpdate,
        StreamType::OpenDashboard,
        StreamType::AudioChunk,
        StreamType::Video,
        StreamType::All,
        StreamType::Wildcard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::ButtonPress => "button_press",
            StreamType::HeadPosition => "head_position",
            StreamType::PhoneNotifications => "phone_notifications",
            StreamType::Transcription => "transcription",
            StreamType::Translation => "translation",
            StreamType::GlassesBatteryUpdate => "glasses_battery_update",
            StreamType::PhoneBatteryUpdate => "phone_battery_update",
            StreamType::LocationUpdate => "location_update",
            StreamType::OpenDashboard => "open_dashboard",
            StreamType::AudioChunk => "audio_chunk",
            StreamType::Video => "video",
            StreamType::All => "all",
            StreamType::Wildcard => "*",
        }
    }

    /// `all` and `*` are control tags that match every concrete stream.
    pub fn is_catch_all(&self) -> bool {
        matches!(self, StreamType::All | StreamType::Wildcard)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamType::ALL_TYPES
            .iter()
            .copied()
            .find(|stream| stream.as_str() == s)
            .ok_or_else(|| format!("unknown stream type {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressType {
    Short,
    Long,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonPress {
    pub button_id: String,
    pub press_type: PressType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadPositionKind {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadPosition {
    pub position: HeadPositionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNotification {
    pub notification_id: String,
    pub app: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionData {
    pub text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl TranscriptionData {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            start_time: None,
            end_time: None,
            speaker_id: None,
            language: None,
        }
    }

    pub fn final_result(text: impl Into<String>) -> Self {
        Self {
            is_final: true,
            ..Self::interim(text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationData {
    pub text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcribe_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translate_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryUpdate {
    pub level: u8,
    pub charging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Typed view over the `data` field of a `data_stream` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    ButtonPress(ButtonPress),
    HeadPosition(HeadPosition),
    PhoneNotification(PhoneNotification),
    Transcription(TranscriptionData),
    Translation(TranslationData),
    GlassesBattery(BatteryUpdate),
    PhoneBattery(BatteryUpdate),
    Location(LocationUpdate),
    /// Streams without a structured shape (audio, video, dashboard control).
    Raw(Value),
}

impl StreamPayload {
    /// Decodes `data` according to the shape implied by `stream`.
    pub fn decode(stream: StreamType, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match stream {
            StreamType::ButtonPress => StreamPayload::ButtonPress(serde_json::from_value(data)?),
            StreamType::HeadPosition => StreamPayload::HeadPosition(serde_json::from_value(data)?),
            StreamType::PhoneNotifications => {
                StreamPayload::PhoneNotification(serde_json::from_value(data)?)
            }
            StreamType::Transcription => {
                StreamPayload::Transcription(serde_json::from_value(data)?)
            }
            StreamType::Translation => StreamPayload::Translation(serde_json::from_value(data)?),
            StreamType::GlassesBatteryUpdate => {
                StreamPayload::GlassesBattery(serde_json::from_value(data)?)
            }
            StreamType::PhoneBatteryUpdate => {
                StreamPayload::PhoneBattery(serde_json::from_value(data)?)
            }
            StreamType::LocationUpdate => StreamPayload::Location(serde_json::from_value(data)?),
            StreamType::OpenDashboard
            | StreamType::AudioChunk
            | StreamType::Video
            | StreamType::All
            | StreamType::Wildcard => StreamPayload::Raw(data),
        })
    }
}
