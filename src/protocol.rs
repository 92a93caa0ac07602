//! JSON events exchanged with the realtime speech service.

use serde::{Deserialize, Serialize};

use crate::config::{AudioConfig, SessionConfig};

/// Events this client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSettings {
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionSettings,
    pub turn_detection: TurnDetection,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl SessionSettings {
    pub fn from_config(session: &SessionConfig, audio: &AudioConfig) -> Self {
        Self {
            instructions: session.instructions.clone(),
            voice: session.voice.clone(),
            input_audio_format: audio.stream_format.clone(),
            output_audio_format: audio.stream_format.clone(),
            input_audio_transcription: TranscriptionSettings {
                model: session.transcription_model.clone(),
            },
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: session.vad_threshold,
                prefix_padding_ms: session.prefix_padding_ms,
                silence_duration_ms: session.silence_duration_ms,
            },
        }
    }
}

/// Events received from the service. Anything not listed lands on
/// `Unknown` and is ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: Option<ResponseInfo>,
    },
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        delta: String,
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.audio.done", alias = "response.output_audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.interrupted")]
    Interrupted,
    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.output_audio_transcript.done"
    )]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

const AUTH_ERROR_CODES: &[&str] = &[
    "invalid_api_key",
    "invalid_authorization",
    "unauthorized",
    "authentication_error",
    "token_expired",
    "session_expired",
];

impl ErrorDetail {
    /// Whether the service rejected our credential rather than the request.
    pub fn is_unauthorized(&self) -> bool {
        let coded = [self.code.as_deref(), self.kind.as_deref()]
            .into_iter()
            .flatten()
            .any(|c| AUTH_ERROR_CODES.contains(&c));
        if coded {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        message.contains("unauthorized") || message.contains("authentication")
    }
}

pub fn parse_server_event(text: &str) -> Result<ServerEvent, serde_json::Error> {
    serde_json::from_str(text)
}
