mod client;
mod event;
mod message;
mod state;
pub mod transport;

pub use client::{SessionConfig, VoiceSessionClient};
pub use event::{EventDispatcher, EventKind, SessionEvent};
pub use message::{AudioChunk, ChatMessage, ChunkEncoder, Role};
pub use state::{ConnectionState, ConversationState};
pub use transport::{Transport, WebSocketTransport};
