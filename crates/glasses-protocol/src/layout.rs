use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutType {
    TextWall,
    TextRows,
    TextLine,
    ReferenceCard,
}

/// Display intent rendered by the glasses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layoutType", rename_all = "snake_case")]
pub enum Layout {
    TextWall { text: String },
    TextRows { text: Vec<String> },
    TextLine { text: String },
    ReferenceCard { title: String, text: String },
}

impl Layout {
    pub fn layout_type(&self) -> LayoutType {
        match self {
            Layout::TextWall { .. } => LayoutType::TextWall,
            Layout::TextRows { .. } => LayoutType::TextRows,
            Layout::TextLine { .. } => LayoutType::TextLine,
            Layout::ReferenceCard { .. } => LayoutType::ReferenceCard,
        }
    }

    /// Layout pushed to the glasses when the screen goes idle.
    pub fn blank() -> Self {
        Layout::TextWall {
            text: String::new(),
        }
    }
}

/// Body of a `display_event` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayRequest {
    pub layout: Layout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
}

impl DisplayRequest {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            duration_ms: None,
            package_name: None,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_package_name(mut self, package_name: impl Into<String>) -> Self {
        self.package_name = Some(package_name.into());
        self
    }
}
