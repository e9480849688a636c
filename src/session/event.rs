use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::message::{ChatMessage, Role};
use super::state::{ConnectionState, ConversationState};
use crate::error::ProtocolError;
use crate::protocol::ScenarioReport;

/// Everything the session reports to its UI consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    ConversationChanged(ConversationState),
    Ready,
    Transcript {
        role: Role,
        text: String,
        is_final: bool,
    },
    Message(ChatMessage),
    SpeechStarted,
    SpeechStopped,
    /// Decoded AI speech, f32 mono.
    Audio { samples: Vec<f32>, sample_rate: u32 },
    /// The server closed out the practice scenario.
    SessionReport(ScenarioReport),
    ProtocolError(ProtocolError),
    /// Transport failure or a server-reported error, with a reason string.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChanged,
    ConversationChanged,
    Ready,
    Transcript,
    Message,
    SpeechStarted,
    SpeechStopped,
    Audio,
    SessionReport,
    ProtocolError,
    Error,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::StateChanged(_) => EventKind::StateChanged,
            SessionEvent::ConversationChanged(_) => EventKind::ConversationChanged,
            SessionEvent::Ready => EventKind::Ready,
            SessionEvent::Transcript { .. } => EventKind::Transcript,
            SessionEvent::Message(_) => EventKind::Message,
            SessionEvent::SpeechStarted => EventKind::SpeechStarted,
            SessionEvent::SpeechStopped => EventKind::SpeechStopped,
            SessionEvent::Audio { .. } => EventKind::Audio,
            SessionEvent::SessionReport(_) => EventKind::SessionReport,
            SessionEvent::ProtocolError(_) => EventKind::ProtocolError,
            SessionEvent::Error(_) => EventKind::Error,
        }
    }
}

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Fans events out to per-kind callbacks and to channel subscribers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Mutex<Vec<(EventKind, Handler)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.push((kind, Arc::new(handler)));
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(tx);
        rx
    }

    pub fn emit(&self, event: SessionEvent) {
        let kind = event.kind();
        // Handlers run without the lock held so they may call back into the client.
        let matching: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, h)| h.clone())
                .collect()
        };
        for handler in matching {
            handler(&event);
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
