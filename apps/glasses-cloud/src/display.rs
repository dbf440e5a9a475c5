//! Single-display arbitration. The glasses show one thing at a time; the most
//! recent accepted request wins.

use glasses_protocol::DisplayRequest;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveDisplay {
    pub package_name: String,
    pub request: DisplayRequest,
    pub expires_at: Option<Instant>,
    /// Distinguishes this display from any that replaced it.
    pub generation: u64,
}

impl ActiveDisplay {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
pub struct DisplayManager {
    active: Option<ActiveDisplay>,
    next_generation: u64,
}

impl DisplayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the active display with `request` on behalf of `package_name`.
    ///
    /// Returns `false` without touching state when the owning session is no
    /// longer connected.
    pub fn handle_display_event(
        &mut self,
        package_name: &str,
        mut request: DisplayRequest,
        session_open: bool,
        now: Instant,
    ) -> bool {
        if !session_open {
            debug!(package = package_name, "display request for closed session ignored");
            return false;
        }

        request.package_name = Some(package_name.to_string());
        let expires_at = request
            .duration_ms
            .map(|ms| now + Duration::from_millis(ms));
        self.next_generation += 1;
        self.active = Some(ActiveDisplay {
            package_name: package_name.to_string(),
            request,
            expires_at,
            generation: self.next_generation,
        });
        true
    }

    pub fn handle_app_start(&mut self, package_name: &str) {
        info!(package = package_name, "app started; display unchanged");
    }

    /// Clears the display if `package_name` owns it. Returns whether it did.
    pub fn handle_app_stop(&mut self, package_name: &str) -> bool {
        let owned = self
            .active
            .as_ref()
            .is_some_and(|active| active.package_name == package_name);
        if owned {
            self.active = None;
            info!(package = package_name, "cleared display owned by stopped app");
        }
        owned
    }

    /// Drops the display if its TTL has elapsed. Returns whether it did.
    pub fn expire_due(&mut self, now: Instant) -> bool {
        if self.active.as_ref().is_some_and(|active| active.is_expired(now)) {
            self.active = None;
            return true;
        }
        false
    }

    /// Timer path: only clears the display it was scheduled for.
    pub fn expire_generation(&mut self, generation: u64, now: Instant) -> bool {
        match &self.active {
            Some(active) if active.generation == generation && active.is_expired(now) => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    /// The live display at `now`, ignoring anything past its TTL.
    pub fn current(&self, now: Instant) -> Option<&ActiveDisplay> {
        self.active.as_ref().filter(|active| !active.is_expired(now))
    }

    pub fn clear(&mut self) -> bool {
        self.active.take().is_some()
    }
}
