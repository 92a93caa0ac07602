//! Local UDP adapters for the in-page capture hook and the virtual
//! microphone.
//!
//! Capture datagrams start with a one-byte kind: `0x01` is followed by
//! little-endian `f32` samples, `0x02` by a JSON control message. The
//! microphone receives bare little-endian `f32` samples.

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

use crate::audio::{AudioFrame, Delivery, VirtualMic};
use crate::config::Config;

const KIND_FRAME: u8 = 0x01;
const KIND_CONTROL: u8 = 0x02;

#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    Frame(AudioFrame),
    MeetingEnded,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeControl {
    MeetingEnded,
}

pub struct AudioBridge {
    socket: Arc<UdpSocket>,
    sample_rate: u32,
    buffer_size: usize,
    tx: mpsc::Sender<AudioEvent>,
}

impl AudioBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<AudioEvent>) -> Result<Self> {
        let addr = format!(
            "{}:{}",
            config.bridge.capture_local_ip, config.bridge.capture_local_port
        );
        let socket = UdpSocket::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind capture socket on {}", addr))?;
        log::info!("Listening for meeting audio on {}", addr);

        Ok(Self {
            socket: Arc::new(socket),
            sample_rate: config.audio.meeting_sample_rate,
            buffer_size: config.bridge.buffer_size,
            tx,
        })
    }

    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Some(event) = parse_datagram(&buf[..len], self.sample_rate) else {
                continue;
            };
            if self.tx.send(event).await.is_err() {
                log::info!("Core loop is gone, stopping capture bridge");
                return Ok(());
            }
        }
    }
}

fn parse_datagram(data: &[u8], sample_rate: u32) -> Option<AudioEvent> {
    let (&kind, mut payload) = data.split_first()?;
    match kind {
        KIND_FRAME => {
            if payload.len() % 4 != 0 {
                log::warn!("Dropping capture frame with {} trailing bytes", payload.len() % 4);
                return None;
            }
            let mut samples = Vec::with_capacity(payload.len() / 4);
            while payload.has_remaining() {
                samples.push(payload.get_f32_le());
            }
            if samples.is_empty() {
                return None;
            }
            Some(AudioEvent::Frame(AudioFrame::new(samples, sample_rate)))
        }
        KIND_CONTROL => match serde_json::from_slice::<BridgeControl>(payload) {
            Ok(BridgeControl::MeetingEnded) => Some(AudioEvent::MeetingEnded),
            Err(e) => {
                log::warn!("Ignoring capture control message: {}", e);
                None
            }
        },
        other => {
            log::warn!("Ignoring capture datagram of kind {:#04x}", other);
            None
        }
    }
}

/// Virtual microphone fed over a connected UDP socket, paced at real time.
pub struct UdpMic {
    socket: UdpSocket,
    sample_rate: u32,
    max_datagram: usize,
}

impl UdpMic {
    pub async fn connect(config: &Config) -> Result<Self> {
        let remote = format!("{}:{}", config.bridge.mic_remote_ip, config.bridge.mic_remote_port);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(&remote)
            .await
            .with_context(|| format!("Failed to reach virtual microphone at {}", remote))?;
        log::info!("Virtual microphone at {}", remote);

        Ok(Self {
            socket,
            sample_rate: config.audio.meeting_sample_rate,
            max_datagram: config.bridge.buffer_size,
        })
    }
}

#[async_trait]
impl VirtualMic for UdpMic {
    async fn play(&self, samples: &[f32]) -> Result<Delivery> {
        let per_datagram = (self.max_datagram / 4).max(1);
        for part in samples.chunks(per_datagram) {
            let mut buf = BytesMut::with_capacity(part.len() * 4);
            for &sample in part {
                buf.put_f32_le(sample);
            }
            match self.socket.send(&buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    return Ok(Delivery::SinkGone);
                }
                Err(e) => return Err(e).context("Failed to send to virtual microphone"),
            }
        }

        let secs = samples.len() as f64 / self.sample_rate.max(1) as f64;
        sleep(Duration::from_secs_f64(secs)).await;
        Ok(Delivery::Played)
    }
}
