use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use glasses_protocol::InstalledApp;
use metrics::{counter, gauge};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{
    audio::AudioSettings,
    user_session::{SessionSnapshot, UserSession},
};

pub const DEFAULT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session survives without its glasses before it is reaped.
    pub grace_period: Duration,
    pub reap_interval: Duration,
    pub per_connection_buffer: usize,
    pub audio: AudioSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
            audio: AudioSettings::default(),
        }
    }
}

/// Live user sessions keyed by session id.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    sessions: DashMap<String, Arc<UserSession>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                sessions: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn create(&self, user_id: &str, installed_apps: Vec<InstalledApp>) -> Arc<UserSession> {
        let session_id = Uuid::new_v4().to_string();
        let session = UserSession::new(
            session_id.clone(),
            user_id,
            installed_apps,
            &self.inner.config.audio,
        );
        self.inner.sessions.insert(session_id.clone(), Arc::clone(&session));

        counter!("glasses_cloud_sessions_created_total", 1);
        gauge!("glasses_cloud_sessions_active", self.len() as f64);
        info!(session_id = %session_id, user_id, "user session created");
        session
    }

    /// Looks up a session the glasses want to resume. Only the owning user
    /// may resume it.
    pub fn resume(&self, session_id: &str, user_id: &str) -> Option<Arc<UserSession>> {
        let session = self.get(session_id)?;
        if session.user_id() != user_id || session.is_terminated() {
            return None;
        }
        counter!("glasses_cloud_sessions_resumed_total", 1);
        Some(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<UserSession>> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn mark_disconnected(&self, session_id: &str, at: Instant) -> bool {
        match self.get(session_id) {
            Some(session) => {
                session.mark_disconnected(at);
                true
            }
            None => false,
        }
    }

    /// Terminates and removes sessions whose glasses have been gone longer
    /// than the grace period. Returns how many were reaped.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let grace = self.inner.config.grace_period;
        let expired: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .disconnected_since()
                    .is_some_and(|since| now.saturating_duration_since(since) >= grace)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for session_id in expired {
            // Re-check: the glasses may have come back since the scan.
            let Some((_, session)) = self.inner.sessions.remove_if(&session_id, |_, session| {
                session
                    .disconnected_since()
                    .is_some_and(|since| now.saturating_duration_since(since) >= grace)
            }) else {
                continue;
            };
            session.terminate();
            reaped += 1;
            info!(session_id = %session_id, "reaped disconnected session");
        }

        if reaped > 0 {
            counter!("glasses_cloud_sessions_reaped_total", reaped as u64);
            gauge!("glasses_cloud_sessions_active", self.len() as f64);
        }
        reaped
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<UserSession>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.iter().map(|session| session.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.reap_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        registry.reap_expired(Instant::now());
                    }
                }
            }
        })
    }

    /// Terminates every session. Used on shutdown.
    pub fn terminate_all(&self) {
        let sessions: Vec<Arc<UserSession>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.sessions.clear();
        for session in sessions {
            session.terminate();
        }
    }
}
