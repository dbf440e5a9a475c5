use std::sync::Arc;

use glasses_protocol::{DisplayRequest, Layout, TpaToCloud};

use crate::error::TpaResult;

/// Anything that can put a frame on the wire. Implemented by the session.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: &TpaToCloud) -> TpaResult<()>;
}

/// Builds `display_event` frames stamped with the app's package name.
///
/// `duration_ms` of `None` keeps the content up until something replaces it.
/// Every method fails with [`crate::TpaError::NotConnected`] when the session
/// has no open transport.
#[derive(Clone)]
pub struct LayoutManager {
    package_name: String,
    sink: Arc<dyn MessageSink>,
}

impl LayoutManager {
    pub fn new(package_name: impl Into<String>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            package_name: package_name.into(),
            sink,
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn show_text_wall(&self, text: impl Into<String>, duration_ms: Option<u64>) -> TpaResult<()> {
        self.show(Layout::TextWall { text: text.into() }, duration_ms)
    }

    pub fn show_text_rows<I, S>(&self, rows: I, duration_ms: Option<u64>) -> TpaResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let text = rows.into_iter().map(Into::into).collect();
        self.show(Layout::TextRows { text }, duration_ms)
    }

    pub fn show_text_line(&self, text: impl Into<String>, duration_ms: Option<u64>) -> TpaResult<()> {
        self.show(Layout::TextLine { text: text.into() }, duration_ms)
    }

    pub fn show_reference_card(
        &self,
        title: impl Into<String>,
        text: impl Into<String>,
        duration_ms: Option<u64>,
    ) -> TpaResult<()> {
        self.show(
            Layout::ReferenceCard {
                title: title.into(),
                text: text.into(),
            },
            duration_ms,
        )
    }

    pub fn show(&self, layout: Layout, duration_ms: Option<u64>) -> TpaResult<()> {
        let request = DisplayRequest::new(layout)
            .with_duration_ms(duration_ms)
            .with_package_name(self.package_name.clone());
        self.sink.send(&TpaToCloud::DisplayEvent(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TpaError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<TpaToCloud>>,
        offline: bool,
    }

    impl MessageSink for RecordingSink {
        fn send(&self, message: &TpaToCloud) -> TpaResult<()> {
            if self.offline {
                return Err(TpaError::NotConnected);
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    fn only_request(sink: &RecordingSink) -> DisplayRequest {
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            TpaToCloud::DisplayEvent(request) => request.clone(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn reference_card_carries_package_and_duration() {
        let sink = Arc::new(RecordingSink::default());
        let layouts = LayoutManager::new("org.example.notes", sink.clone());

        layouts
            .show_reference_card("Reminder", "Buy milk", Some(3000))
            .unwrap();

        let request = only_request(&sink);
        assert_eq!(request.package_name.as_deref(), Some("org.example.notes"));
        assert_eq!(request.duration_ms, Some(3000));
        assert_eq!(
            request.layout,
            Layout::ReferenceCard {
                title: "Reminder".into(),
                text: "Buy milk".into()
            }
        );
    }

    #[test]
    fn text_rows_keep_order_and_omit_duration() {
        let sink = Arc::new(RecordingSink::default());
        let layouts = LayoutManager::new("org.example.rows", sink.clone());

        layouts.show_text_rows(["one", "two", "three"], None).unwrap();

        let request = only_request(&sink);
        assert_eq!(request.duration_ms, None);
        assert_eq!(
            request.layout,
            Layout::TextRows {
                text: vec!["one".into(), "two".into(), "three".into()]
            }
        );
    }

    #[test]
    fn offline_sink_reports_not_connected() {
        let sink = Arc::new(RecordingSink {
            offline: true,
            ..Default::default()
        });
        let layouts = LayoutManager::new("org.example.offline", sink.clone());

        assert_eq!(
            layouts.show_text_line("hi", None),
            Err(TpaError::NotConnected)
        );
        assert!(sink.sent.lock().is_empty());
    }
}
