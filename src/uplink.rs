//! Inbound relay: meeting audio frames out to the speech service.
//!
//! Frames are lossy and at-most-once. Nothing is buffered while the socket
//! is down, and a growing socket backlog thins the stream deterministically.

use std::sync::Arc;

use crate::audio::AudioFrame;
use crate::audio::convert::encode_pcm16_base64;
use crate::net_link::{ReconnectReason, SessionSocket};
use crate::protocol::ClientEvent;
use crate::state_machine::SessionState;

const KB: usize = 1024;
const BACKLOG_CRITICAL: usize = 512 * KB;
const BACKLOG_HIGH: usize = 384 * KB;
const BACKLOG_MEDIUM: usize = 256 * KB;
const BACKLOG_LOW: usize = 128 * KB;

/// How much of the stream to drop for a given backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Thinning {
    None,
    DropOneInThree,
    DropOneInTwo,
    DropTwoInThree,
    DropAll,
}

impl Thinning {
    pub fn for_backlog(bytes: usize) -> Self {
        if bytes > BACKLOG_CRITICAL {
            Thinning::DropAll
        } else if bytes > BACKLOG_HIGH {
            Thinning::DropTwoInThree
        } else if bytes > BACKLOG_MEDIUM {
            Thinning::DropOneInTwo
        } else if bytes > BACKLOG_LOW {
            Thinning::DropOneInThree
        } else {
            Thinning::None
        }
    }

    /// Whether the frame in rotation slot `slot` goes out.
    pub fn admits(self, slot: u64) -> bool {
        match self {
            Thinning::None => true,
            Thinning::DropOneInThree => slot % 3 != 0,
            Thinning::DropOneInTwo => slot % 2 == 0,
            Thinning::DropTwoInThree => slot % 3 == 0,
            Thinning::DropAll => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sent { bytes: usize },
    Offline,
    Muted,
    Thinned(Thinning),
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UplinkStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub dropped_offline: u64,
    pub dropped_muted: u64,
    pub thinned: u64,
    pub send_failures: u64,
}

pub struct Uplink {
    socket: Arc<dyn SessionSocket>,
    service_rate: u32,
    rotation: u64,
    level: Thinning,
    stats: UplinkStats,
}

impl Uplink {
    pub fn new(socket: Arc<dyn SessionSocket>, service_rate: u32) -> Self {
        Self {
            socket,
            service_rate,
            rotation: 0,
            level: Thinning::None,
            stats: UplinkStats::default(),
        }
    }

    pub fn stats(&self) -> UplinkStats {
        self.stats
    }

    /// Record a frame that was deliberately not forwarded (half-duplex).
    pub fn mute(&mut self) -> FrameOutcome {
        self.stats.dropped_muted += 1;
        FrameOutcome::Muted
    }

    pub fn on_frame(&mut self, frame: &AudioFrame) -> FrameOutcome {
        let audio = encode_pcm16_base64(&frame.samples, frame.sample_rate, self.service_rate);

        if self.socket.state() != SessionState::Connected {
            self.stats.dropped_offline += 1;
            return FrameOutcome::Offline;
        }

        let level = Thinning::for_backlog(self.socket.buffered_amount());
        if level != self.level {
            log::info!("Uplink thinning {:?} -> {:?}", self.level, level);
            self.level = level;
        }

        let slot = self.rotation;
        self.rotation = self.rotation.wrapping_add(1);
        if !level.admits(slot) {
            self.stats.thinned += 1;
            return FrameOutcome::Thinned(level);
        }

        let text = match serde_json::to_string(&ClientEvent::InputAudioAppend { audio }) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to encode audio frame: {}", e);
                return FrameOutcome::Failed;
            }
        };
        let bytes = text.len();

        match self.socket.send_text(text) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += bytes as u64;
                FrameOutcome::Sent { bytes }
            }
            Err(e) => {
                log::warn!("Dropping frame, send failed: {}", e);
                self.stats.send_failures += 1;
                self.socket.request_reconnect(ReconnectReason::SendFailed);
                FrameOutcome::Failed
            }
        }
    }
}
