use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audio::pcm;
use crate::audio::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One finished utterance in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Length of the spoken audio behind this message, if it was spoken.
    pub duration_sec: Option<f64>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>, duration_sec: Option<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            duration_sec,
        }
    }
}

/// PCM16 little-endian mono audio ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub bytes: Bytes,
    pub sequence: u64,
}

impl AudioChunk {
    pub fn from_samples(samples: &[f32], sequence: u64) -> Self {
        Self {
            bytes: Bytes::from(pcm::float32_to_pcm16_bytes(samples)),
            sequence,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / 2
    }
}

/// Turns capture frames into wire chunks: downsample to the session rate,
/// quantize to PCM16, number sequentially.
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    input_rate: u32,
    output_rate: u32,
    next_sequence: u64,
}

impl ChunkEncoder {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate,
            output_rate,
            next_sequence: 0,
        }
    }

    pub fn encode(&mut self, frame: &AudioFrame) -> AudioChunk {
        let samples = pcm::downsample(&frame.audio_data, self.input_rate, self.output_rate);
        let chunk = AudioChunk::from_samples(&samples, self.next_sequence);
        self.next_sequence += 1;
        chunk
    }
}

/// Per-turn bookkeeping: how much audio each side produced and the
/// assistant's partial transcript.
#[derive(Debug, Default)]
pub(crate) struct TurnTracker {
    user_samples: usize,
    // AI 音频块的采样率可能各不相同，所以按秒累计
    assistant_secs: f64,
    assistant_partial: String,
}

impl TurnTracker {
    pub(crate) fn add_user_samples(&mut self, n: usize) {
        self.user_samples += n;
    }

    pub(crate) fn add_assistant_audio(&mut self, n: usize, sample_rate: u32) {
        self.assistant_secs += pcm::duration_secs(n, sample_rate);
    }

    pub(crate) fn push_assistant_delta(&mut self, delta: &str) {
        self.assistant_partial.push_str(delta);
    }

    pub(crate) fn user_speech_started(&mut self) {
        self.user_samples = 0;
    }

    /// Close the user's turn. Duration is `None` when no audio was sent.
    pub(crate) fn finish_user(&mut self, content: String, sample_rate: u32) -> ChatMessage {
        let duration = duration_of(std::mem::take(&mut self.user_samples), sample_rate);
        ChatMessage::new(Role::User, content, duration)
    }

    /// Close the assistant's turn. An empty final transcript falls back to
    /// the accumulated deltas.
    pub(crate) fn finish_assistant(&mut self, content: String) -> ChatMessage {
        let partial = std::mem::take(&mut self.assistant_partial);
        let content = if content.is_empty() { partial } else { content };
        let secs = std::mem::take(&mut self.assistant_secs);
        ChatMessage::new(Role::Assistant, content, (secs > 0.0).then_some(secs))
    }
}

fn duration_of(samples: usize, sample_rate: u32) -> Option<f64> {
    (samples > 0).then(|| pcm::duration_secs(samples, sample_rate))
}
