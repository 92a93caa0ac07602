use anyhow::{Result, bail};
use serde::Deserialize;

/// Runtime configuration.
///
/// Loaded from an optional `config.toml` and overridden by `MEETVOICE_*`
/// environment variables (`__` separates sections, e.g.
/// `MEETVOICE_NETWORK__API_KEY`). Every key has a default.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
    pub audio: AudioConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    /// Realtime socket URL. Used as-is when `token_url` is empty, otherwise
    /// it is the base the issued credential gets embedded into.
    pub ws_url: String,
    /// Sent as a bearer token on the socket upgrade and the token request.
    pub api_key: String,
    /// Credential endpoint. Empty disables the credential provider.
    pub token_url: String,
    pub model: String,
}

/// Parameters of the one-time `session.update` sent after every open.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub transcription_model: String,
    pub vad_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub max_jitter_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AudioConfig {
    /// Rate of the meeting's audio pipeline (capture and virtual mic)
    pub meeting_sample_rate: u32,
    /// Rate the speech service expects and produces
    pub service_sample_rate: u32,
    /// Wire format of synthesized audio. Only "pcm16" is supported.
    pub stream_format: String,
    /// Upper bound on queued playback chunks; the oldest is dropped beyond it
    pub max_playback_chunks: usize,
    /// Drop captured frames while the assistant is speaking
    pub mute_while_speaking: bool,
}

/// Local UDP endpoints shared with the in-page capture hook and the virtual
/// microphone.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    pub capture_local_ip: String,
    pub capture_local_port: u16,
    pub mic_remote_ip: String,
    pub mic_remote_port: u16,
    pub buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".to_string(),
            api_key: String::new(),
            token_url: String::new(),
            model: "gpt-4o-realtime-preview".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: "You are a participant in a video meeting. Answer briefly and \
                           conversationally."
                .to_string(),
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            vad_threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 6,
            max_jitter_ms: 1_000,
            connect_timeout_ms: 15_000,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            meeting_sample_rate: 48_000,
            service_sample_rate: 24_000,
            stream_format: "pcm16".to_string(),
            max_playback_chunks: 512,
            mute_while_speaking: false,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capture_local_ip: "127.0.0.1".to_string(),
            capture_local_port: 7070,
            mic_remote_ip: "127.0.0.1".to_string(),
            mic_remote_port: 7071,
            buffer_size: 16 * 1024,
        }
    }
}

impl NetworkConfig {
    /// The socket URL to dial directly, or `None` when every connect has to
    /// go through the credential provider.
    pub fn direct_url(&self) -> Option<&str> {
        if self.token_url.is_empty() && !self.ws_url.is_empty() {
            Some(&self.ws_url)
        } else {
            None
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        if self.api_key.is_empty() {
            None
        } else {
            Some(&self.api_key)
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("MEETVOICE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.ws_url.is_empty() && self.network.token_url.is_empty() {
            bail!("either network.ws_url or network.token_url must be set");
        }
        if self.audio.meeting_sample_rate == 0 || self.audio.service_sample_rate == 0 {
            bail!("audio sample rates must be non-zero");
        }
        if self.audio.max_playback_chunks == 0 {
            bail!("audio.max_playback_chunks must be at least 1");
        }
        if self.reconnect.max_attempts == 0 {
            bail!("reconnect.max_attempts must be at least 1");
        }
        if self.bridge.buffer_size < 5 {
            bail!("bridge.buffer_size is too small to carry a single sample");
        }
        Ok(())
    }
}
