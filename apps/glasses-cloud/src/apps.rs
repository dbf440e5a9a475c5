use std::collections::BTreeSet;

use glasses_protocol::{AppSettings, InstalledApp, StreamType};
use time::OffsetDateTime;

use crate::user_session::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// One TPA's participation in a user session.
#[derive(Debug)]
pub struct AppSession {
    pub package_name: String,
    pub state: AppState,
    pub subscriptions: BTreeSet<StreamType>,
    pub settings: AppSettings,
    pub connection: Option<ConnectionHandle>,
    pub started_at: OffsetDateTime,
    pub last_active: OffsetDateTime,
}

impl AppSession {
    pub fn starting(package_name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            package_name: package_name.into(),
            state: AppState::Starting,
            subscriptions: BTreeSet::new(),
            settings: AppSettings::default(),
            connection: None,
            started_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = OffsetDateTime::now_utc();
    }

    pub fn is_running(&self) -> bool {
        self.state == AppState::Running && self.connection.is_some()
    }

    /// Whether a frame on `stream` should reach this app.
    pub fn wants(&self, stream: StreamType) -> bool {
        self.subscriptions.contains(&stream)
            || self.subscriptions.contains(&StreamType::All)
            || self.subscriptions.contains(&StreamType::Wildcard)
    }
}

/// Source of installed apps and their stored settings.
pub trait AppRegistry: Send + Sync + 'static {
    fn installed_apps(&self, user_id: &str) -> Vec<InstalledApp>;

    fn settings(&self, user_id: &str, package_name: &str) -> AppSettings;
}
