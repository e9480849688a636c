//! JSON envelopes exchanged over the realtime channel. Every message is an
//! object tagged by `type`.

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::Config;
use crate::error::ProtocolError;

/// Sample rate of AI speech when `audio.delta` does not say.
pub const DEFAULT_AI_SAMPLE_RATE: u32 = 24000;

/// Messages the backend sends over the realtime channel.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Backend finished its own upstream setup; the session can be configured.
    #[serde(rename = "ready")]
    Ready,

    /// A chunk of AI speech, base64 PCM16.
    #[serde(rename = "audio.delta")]
    AudioDelta {
        #[serde(alias = "audio", alias = "data")]
        delta: String,
        #[serde(default)]
        sample_rate: Option<u32>,
    },

    #[serde(rename = "audio.done")]
    AudioDone,

    /// Partial transcript of the AI's speech.
    #[serde(rename = "transcript.delta")]
    TranscriptDelta {
        #[serde(alias = "delta")]
        content: String,
    },

    #[serde(rename = "transcript.done", alias = "transcript")]
    TranscriptDone {
        #[serde(alias = "transcript")]
        content: String,
    },

    /// Final transcript of what the user said.
    #[serde(rename = "user.transcript", alias = "input_audio.transcript")]
    UserTranscript {
        #[serde(alias = "transcript")]
        content: String,
    },

    #[serde(rename = "speech.started", alias = "speech-started")]
    SpeechStarted,

    #[serde(rename = "speech.stopped", alias = "speech-stopped")]
    SpeechStopped,

    /// End-of-practice summary. The only signal that the scenario is complete.
    #[serde(rename = "session.report", alias = "scenario.completed")]
    SessionReport {
        #[serde(default, alias = "json")]
        report: Option<ScenarioReport>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },

    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// What the practice scenario turned out to be about.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ScenarioReport {
    #[serde(default)]
    pub place: Option<String>,
    #[serde(default)]
    pub conversation_partner: Option<String>,
    #[serde(default)]
    pub conversation_goal: Option<String>,
    #[serde(default, rename = "sessionId", alias = "session_id", deserialize_with = "string_or_number")]
    pub session_id: Option<String>,
}

// sessionId 可能是字符串也可能是数字
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Server-side voice activity detection parameters.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub voice: String,
    pub turn_detection: TurnDetection,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            voice: config.voice.clone(),
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: config.vad_threshold,
                prefix_padding_ms: config.prefix_padding_ms,
                silence_duration_ms: config.silence_duration_ms,
            },
        }
    }
}

/// Messages the client sends over the realtime channel.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String, sample_rate: u32 },

    #[serde(rename = "input_audio_buffer.commit")]
    CommitAudio,

    #[serde(rename = "input_audio_buffer.clear")]
    ClearAudio,

    #[serde(rename = "response.create")]
    CreateResponse,

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "session.update")]
    UpdateSession { session: SessionSettings },

    /// Courtesy notice sent just before the client closes the channel.
    #[serde(rename = "disconnect")]
    Disconnect,
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
