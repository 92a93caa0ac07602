//! Outbound relay: service events in, synthesized audio out to playback.

use std::sync::Arc;

use crate::audio::{PlaybackQueue, StreamDecoder};
use crate::net_link::{ReconnectReason, SessionSocket};
use crate::protocol::{ServerEvent, parse_server_event};
use crate::state_machine::{SessionState, VoiceState};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownlinkStats {
    pub deltas: u64,
    pub enqueued: u64,
    pub discarded: u64,
    pub malformed: u64,
}

pub struct CoreController {
    voice: VoiceState,
    /// A response is producing audio and the gate has been opened for it.
    responding: bool,
    current_response: Option<String>,
    cancelled_response: Option<String>,
    decoder: Box<dyn StreamDecoder>,
    playback: Arc<PlaybackQueue>,
    link: Arc<dyn SessionSocket>,
    stats: DownlinkStats,
}

impl CoreController {
    pub fn new(
        decoder: Box<dyn StreamDecoder>,
        playback: Arc<PlaybackQueue>,
        link: Arc<dyn SessionSocket>,
    ) -> Self {
        Self {
            voice: VoiceState::Idle,
            responding: false,
            current_response: None,
            cancelled_response: None,
            decoder,
            playback,
            link,
            stats: DownlinkStats::default(),
        }
    }

    #[cfg(test)]
    pub fn voice(&self) -> VoiceState {
        self.voice
    }

    pub fn is_speaking(&self) -> bool {
        self.voice == VoiceState::Speaking
    }

    pub fn stats(&self) -> DownlinkStats {
        self.stats
    }

    pub fn handle_server_text(&mut self, text: &str) {
        match parse_server_event(text) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                self.stats.malformed += 1;
                log::warn!("Ignoring malformed service message: {}", e);
            }
        }
    }

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated => log::info!("Service session created"),
            ServerEvent::SessionUpdated => log::info!("Service session configured"),
            ServerEvent::SpeechStarted => {
                log::debug!("Participant started speaking");
                self.set_voice(VoiceState::Recording);
            }
            ServerEvent::SpeechStopped => {
                log::debug!("Participant stopped speaking");
                self.set_voice(VoiceState::Processing);
            }
            ServerEvent::ResponseCreated { response } => {
                self.responding = false;
                self.current_response = response.and_then(|r| r.id);
            }
            ServerEvent::AudioDelta { delta, response_id } => {
                self.on_audio_delta(&delta, response_id);
            }
            ServerEvent::AudioDone { .. } => {
                self.responding = false;
                self.set_voice(VoiceState::Idle);
                self.playback.finish_response();
            }
            ServerEvent::Interrupted => {
                let discarded = self.playback.interrupt();
                log::info!("Interrupted, discarded {} queued chunks", discarded);
                self.cancelled_response = self.current_response.take();
                self.responding = false;
                self.set_voice(VoiceState::Recording);
            }
            ServerEvent::AudioTranscriptDone { transcript } => {
                log::info!("Assistant: {}", transcript);
            }
            ServerEvent::InputTranscriptCompleted { transcript } => {
                log::info!("Participant: {}", transcript);
            }
            ServerEvent::Error { error } => {
                log::warn!(
                    "Service error ({}): {}",
                    error.code.as_deref().unwrap_or("no code"),
                    error.message
                );
                if error.is_unauthorized() {
                    self.link.request_reconnect(ReconnectReason::Unauthorized);
                } else {
                    self.set_voice(VoiceState::Idle);
                }
            }
            ServerEvent::Unknown => {}
        }
    }

    fn on_audio_delta(&mut self, delta: &str, response_id: Option<String>) {
        self.stats.deltas += 1;

        if response_id.is_some() && response_id == self.cancelled_response {
            self.stats.discarded += 1;
            return;
        }
        if self.link.state() != SessionState::Connected || !self.playback.is_sink_live() {
            self.stats.discarded += 1;
            return;
        }

        if !self.responding {
            self.responding = true;
            if response_id.is_some() {
                self.current_response = response_id;
            }
            self.set_voice(VoiceState::Speaking);
            self.playback.set_accepting(true);
        }

        let samples = match self.decoder.decode(delta) {
            Ok(samples) => samples,
            Err(e) => {
                self.stats.malformed += 1;
                log::warn!("Dropping undecodable audio delta: {:#}", e);
                return;
            }
        };
        if samples.is_empty() {
            return;
        }

        if self.playback.offer(samples) {
            self.stats.enqueued += 1;
        } else {
            self.stats.discarded += 1;
        }
    }

    /// Back to initial values after a teardown.
    pub fn reset(&mut self) {
        self.voice = VoiceState::Idle;
        self.responding = false;
        self.current_response = None;
        self.cancelled_response = None;
        self.playback.reset();
    }

    fn set_voice(&mut self, voice: VoiceState) {
        if self.voice != voice {
            log::debug!("Voice state {} -> {}", self.voice, voice);
            self.voice = voice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::convert::encode_pcm16_base64;
    use crate::audio::playback::tests::{RecordingMic, wait_idle};
    use crate::audio::stream_decoder::Pcm16Decoder;
    use crate::uplink::tests::FakeSocket;

    struct Rig {
        controller: CoreController,
        mic: Arc<RecordingMic>,
        playback: Arc<PlaybackQueue>,
        socket: Arc<FakeSocket>,
    }

    fn rig() -> Rig {
        let mic = Arc::new(RecordingMic::default());
        let playback = PlaybackQueue::new(mic.clone(), 64);
        let socket = FakeSocket::new(SessionState::Connected);
        let controller = CoreController::new(
            Box::new(Pcm16Decoder::new(24_000, 48_000)),
            playback.clone(),
            socket.clone(),
        );
        Rig {
            controller,
            mic,
            playback,
            socket,
        }
    }

    fn delta(level: f32, response: Option<&str>) -> String {
        let audio = encode_pcm16_base64(&[level; 4], 24_000, 24_000);
        match response {
            Some(id) => format!(
                r#"{{"type":"response.audio.delta","response_id":"{}","delta":"{}"}}"#,
                id, audio
            ),
            None => format!(r#"{{"type":"response.audio.delta","delta":"{}"}}"#, audio),
        }
    }

    #[tokio::test]
    async fn delta_is_upsampled_and_played() {
        let mut rig = rig();
        rig.controller.handle_server_text(&delta(-0.5, None));
        assert!(rig.controller.is_speaking());

        wait_idle(&rig.playback).await;
        assert_eq!(*rig.mic.played.lock().unwrap(), vec![-0.5]);
        assert_eq!(rig.controller.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn done_keeps_queued_audio_but_closes_gate() {
        let mut rig = rig();
        rig.controller.handle_server_text(&delta(0.25, None));
        rig.controller.handle_server_text(r#"{"type":"response.audio.done"}"#);

        assert_eq!(rig.controller.voice(), VoiceState::Idle);
        assert!(!rig.playback.is_accepting());

        wait_idle(&rig.playback).await;
        assert_eq!(rig.mic.played.lock().unwrap().len(), 1);
        assert!(rig.playback.is_accepting());
    }

    #[tokio::test]
    async fn late_deltas_of_interrupted_response_are_dropped() {
        let mut rig = rig();
        rig.controller
            .handle_server_text(r#"{"type":"response.created","response":{"id":"r1"}}"#);
        rig.controller.handle_server_text(&delta(0.25, Some("r1")));
        rig.controller.handle_server_text(r#"{"type":"response.interrupted"}"#);
        assert_eq!(rig.controller.voice(), VoiceState::Recording);

        rig.controller.handle_server_text(&delta(0.25, Some("r1")));
        assert_eq!(rig.controller.stats().discarded, 1);
        assert_eq!(rig.playback.len(), 0);

        rig.controller
            .handle_server_text(r#"{"type":"response.created","response":{"id":"r2"}}"#);
        rig.controller.handle_server_text(&delta(-0.75, Some("r2")));
        wait_idle(&rig.playback).await;
        assert_eq!(rig.mic.played.lock().unwrap().last(), Some(&-0.75));
    }

    #[tokio::test]
    async fn deltas_are_dropped_while_session_is_down() {
        let mut rig = rig();
        *rig.socket.state.lock().unwrap() = SessionState::Connecting;
        rig.controller.handle_server_text(&delta(-0.5, None));

        assert_eq!(rig.controller.stats().discarded, 1);
        assert_eq!(rig.controller.stats().enqueued, 0);
        assert_eq!(rig.playback.len(), 0);
        assert!(!rig.controller.is_speaking());

        *rig.socket.state.lock().unwrap() = SessionState::Connected;
        rig.controller.handle_server_text(&delta(-0.5, None));
        wait_idle(&rig.playback).await;
        assert_eq!(*rig.mic.played.lock().unwrap(), vec![-0.5]);
    }

    #[tokio::test]
    async fn unauthorized_error_requests_reconnect() {
        let mut rig = rig();
        rig.controller.handle_server_text(
            r#"{"type":"error","error":{"message":"Invalid token","code":"invalid_api_key"}}"#,
        );
        assert_eq!(
            *rig.socket.reconnects.lock().unwrap(),
            vec![ReconnectReason::Unauthorized]
        );
    }

    #[tokio::test]
    async fn other_errors_return_to_idle() {
        let mut rig = rig();
        rig.controller.handle_server_text(&delta(0.25, None));
        rig.controller.handle_server_text(
            r#"{"type":"error","error":{"message":"Rate limited","code":"rate_limit_exceeded"}}"#,
        );
        assert_eq!(rig.controller.voice(), VoiceState::Idle);
        assert!(rig.socket.reconnects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_messages_are_counted_and_ignored() {
        let mut rig = rig();
        rig.controller.handle_server_text("{not json");
        rig.controller
            .handle_server_text(r#"{"type":"response.audio.delta","delta":"%%%"}"#);
        assert_eq!(rig.controller.stats().malformed, 2);
        assert_eq!(rig.controller.voice(), VoiceState::Speaking);
        assert_eq!(rig.playback.len(), 0);
    }

    #[tokio::test]
    async fn reset_restores_initial_state() {
        let mut rig = rig();
        rig.controller.handle_server_text(&delta(0.25, None));
        rig.controller.handle_server_text(r#"{"type":"response.interrupted"}"#);
        rig.controller.reset();

        assert_eq!(rig.controller.voice(), VoiceState::Idle);
        assert!(rig.playback.is_accepting());
        assert_eq!(rig.playback.len(), 0);
    }
}
