//! Observer table keyed by event name.
//!
//! Handlers for one event run in registration order. The table lock is not
//! held while handlers run, so a handler may register or unregister others.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use glasses_protocol::{
    AppSettings, BatteryUpdate, ButtonPress, HeadPosition, LocationUpdate, PhoneNotification,
    StreamPayload, StreamType, TranscriptionData, TranslationData,
};
use parking_lot::Mutex;

use crate::error::TpaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connected,
    Disconnected,
    Error,
    SettingsUpdate,
    Stream(StreamType),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Handshake acknowledged; carries the settings restored from the cloud.
    Connected(AppSettings),
    Disconnected(String),
    Error(TpaError),
    SettingsUpdate(AppSettings),
    Stream {
        stream: StreamType,
        payload: StreamPayload,
    },
}

impl SessionEvent {
    pub fn name(&self) -> EventName {
        match self {
            SessionEvent::Connected(_) => EventName::Connected,
            SessionEvent::Disconnected(_) => EventName::Disconnected,
            SessionEvent::Error(_) => EventName::Error,
            SessionEvent::SettingsUpdate(_) => EventName::SettingsUpdate,
            SessionEvent::Stream { stream, .. } => EventName::Stream(*stream),
        }
    }
}

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct DispatchTable {
    next_id: u64,
    handlers: HashMap<EventName, Vec<(u64, Handler)>>,
}

#[derive(Clone, Default)]
pub struct EventManager {
    table: Arc<Mutex<DispatchTable>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, name: EventName, handler: F) -> HandlerHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut table = self.table.lock();
        let id = table.next_id;
        table.next_id += 1;
        table
            .handlers
            .entry(name)
            .or_default()
            .push((id, Arc::new(handler)));
        HandlerHandle {
            name,
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Invokes every handler registered for the event's name and returns how
    /// many ran.
    pub fn emit(&self, event: &SessionEvent) -> usize {
        let handlers: Vec<Handler> = {
            let table = self.table.lock();
            match table.handlers.get(&event.name()) {
                Some(entries) => entries.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
                None => return 0,
            }
        };

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn handler_count(&self, name: EventName) -> usize {
        self.table
            .lock()
            .handlers
            .get(&name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn on_connected<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&AppSettings) + Send + Sync + 'static,
    {
        self.on(EventName::Connected, move |event| {
            if let SessionEvent::Connected(settings) = event {
                handler(settings);
            }
        })
    }

    pub fn on_disconnected<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on(EventName::Disconnected, move |event| {
            if let SessionEvent::Disconnected(reason) = event {
                handler(reason);
            }
        })
    }

    pub fn on_error<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&TpaError) + Send + Sync + 'static,
    {
        self.on(EventName::Error, move |event| {
            if let SessionEvent::Error(err) = event {
                handler(err);
            }
        })
    }

    pub fn on_settings_update<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&AppSettings) + Send + Sync + 'static,
    {
        self.on(EventName::SettingsUpdate, move |event| {
            if let SessionEvent::SettingsUpdate(settings) = event {
                handler(settings);
            }
        })
    }

    pub fn on_transcription<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&TranscriptionData) + Send + Sync + 'static,
    {
        self.on_stream(StreamType::Transcription, move |payload| {
            if let StreamPayload::Transcription(data) = payload {
                handler(data);
            }
        })
    }

    pub fn on_translation<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&TranslationData) + Send + Sync + 'static,
    {
        self.on_stream(StreamType::Translation, move |payload| {
            if let StreamPayload::Translation(data) = payload {
                handler(data);
            }
        })
    }

    pub fn on_head_position<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&HeadPosition) + Send + Sync + 'static,
    {
        self.on_stream(StreamType::HeadPosition, move |payload| {
            if let StreamPayload::HeadPosition(data) = payload {
                handler(data);
            }
        })
    }

    pub fn on_button_press<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&ButtonPress) + Send + Sync + 'static,
    {
        self.on_stream(StreamType::ButtonPress, move |payload| {
            if let StreamPayload::ButtonPress(data) = payload {
                handler(data);
            }
        })
    }

    pub fn on_phone_notifications<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&PhoneNotification) + Send + Sync + 'static,
    {
        self.on_stream(StreamType::PhoneNotifications, move |payload| {
            if let StreamPayload::PhoneNotification(data) = payload {
                handler(data);
            }
        })
    }

    pub fn on_glasses_battery<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&BatteryUpdate) + Send + Sync + 'static,
    {
        self.on_stream(StreamType::GlassesBatteryUpdate, move |payload| {
            if let StreamPayload::GlassesBattery(data) = payload {
                handler(data);
            }
        })
    }

    pub fn on_location<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&LocationUpdate) + Send + Sync + 'static,
    {
        self.on_stream(StreamType::LocationUpdate, move |payload| {
            if let StreamPayload::Location(data) = payload {
                handler(data);
            }
        })
    }

    /// Registers for an arbitrary stream, including untyped ones such as
    /// `audio_chunk`.
    pub fn on_stream<F>(&self, stream: StreamType, handler: F) -> HandlerHandle
    where
        F: Fn(&StreamPayload) + Send + Sync + 'static,
    {
        self.on(EventName::Stream(stream), move |event| {
            if let SessionEvent::Stream { payload, .. } = event {
                handler(payload);
            }
        })
    }
}

/// Returned by every registration; removes the handler when unregistered.
#[derive(Debug, Clone)]
pub struct HandlerHandle {
    name: EventName,
    id: u64,
    table: Weak<Mutex<DispatchTable>>,
}

impl HandlerHandle {
    pub fn event_name(&self) -> EventName {
        self.name
    }

    /// Returns `true` if the handler was still registered. Calling this again
    /// is a no-op.
    pub fn unregister(&self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let mut table = table.lock();
        let Some(entries) = table.handlers.get_mut(&self.name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != self.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            table.handlers.remove(&self.name);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glasses_protocol::PressType;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&SessionEvent) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |label: &str| -> Box<dyn Fn(&SessionEvent) + Send + Sync> {
                let log = Arc::clone(&log);
                let label = label.to_string();
                Box::new(move |_event: &SessionEvent| log.lock().push(label.clone()))
            }
        };
        (log, make)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let events = EventManager::new();
        let (log, make) = recorder();
        let first = make("first");
        let second = make("second");
        let _a = events.on(EventName::Disconnected, move |event| first(event));
        let _b = events.on(EventName::Disconnected, move |event| second(event));

        let ran = events.emit(&SessionEvent::Disconnected("closed".into()));
        assert_eq!(ran, 2);
        assert_eq!(log.lock().as_slice(), ["first", "second"]);
    }

    #[test]
    fn unregister_is_idempotent() {
        let events = EventManager::new();
        let handle = events.on(EventName::Error, |_| {});
        assert_eq!(events.handler_count(EventName::Error), 1);
        assert!(handle.unregister());
        assert!(!handle.unregister());
        assert_eq!(events.handler_count(EventName::Error), 0);
        assert_eq!(events.emit(&SessionEvent::Error(TpaError::Timeout)), 0);
    }

    #[test]
    fn unregistering_one_handler_keeps_the_rest() {
        let events = EventManager::new();
        let (log, make) = recorder();
        let keep = make("keep");
        let drop_me = make("drop");
        let removed = events.on(EventName::Connected, move |event| drop_me(event));
        let _kept = events.on(EventName::Connected, move |event| keep(event));

        removed.unregister();
        events.emit(&SessionEvent::Connected(AppSettings::default()));
        assert_eq!(log.lock().as_slice(), ["keep"]);
    }

    #[test]
    fn handler_may_unregister_itself_during_dispatch() {
        let events = EventManager::new();
        let slot: Arc<Mutex<Option<HandlerHandle>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0usize));
        let handle = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            events.on(EventName::SettingsUpdate, move |_| {
                *calls.lock() += 1;
                if let Some(handle) = slot.lock().as_ref() {
                    handle.unregister();
                }
            })
        };
        *slot.lock() = Some(handle);

        events.emit(&SessionEvent::SettingsUpdate(AppSettings::default()));
        events.emit(&SessionEvent::SettingsUpdate(AppSettings::default()));
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn stream_events_route_by_stream_type() {
        let events = EventManager::new();
        let presses = Arc::new(Mutex::new(Vec::new()));
        let _handle = {
            let presses = Arc::clone(&presses);
            events.on_button_press(move |press| presses.lock().push(press.button_id.clone()))
        };
        let _other = events.on_transcription(|_| panic!("wrong stream"));

        let ran = events.emit(&SessionEvent::Stream {
            stream: StreamType::ButtonPress,
            payload: StreamPayload::ButtonPress(ButtonPress {
                button_id: "side".into(),
                press_type: PressType::Short,
                timestamp: None,
            }),
        });
        assert_eq!(ran, 1);
        assert_eq!(presses.lock().as_slice(), ["side"]);
    }
}
