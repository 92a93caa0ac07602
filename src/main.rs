mod audio;
mod audio_bridge;
mod config;
mod controller;
mod credential;
mod net_link;
mod protocol;
mod state_machine;
mod uplink;

use std::sync::Arc;

use anyhow::anyhow;
use audio::{PlaybackQueue, create_decoder};
use audio_bridge::{AudioBridge, AudioEvent, UdpMic};
use controller::CoreController;
use credential::{CredentialProvider, HttpCredentialProvider};
use net_link::{NetEvent, NetLink};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use uplink::Uplink;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load("config")?;

    let (tx_net_event, mut rx_net_event) = mpsc::channel::<NetEvent>(100);
    let (tx_audio_event, mut rx_audio_event) = mpsc::channel::<AudioEvent>(100);

    let credentials = HttpCredentialProvider::from_config(&config)?
        .map(|p| Arc::new(p) as Arc<dyn CredentialProvider>);
    let (net_link, link) = NetLink::new(&config, credentials, tx_net_event)?;
    let mut link_task = tokio::spawn(net_link.run());
    link.connect();

    let mic = Arc::new(UdpMic::connect(&config).await?);
    let playback = PlaybackQueue::new(mic, config.audio.max_playback_chunks);
    let mut controller = CoreController::new(
        create_decoder(&config.audio)?,
        playback.clone(),
        link.clone(),
    );
    let mut uplink = Uplink::new(link.clone(), config.audio.service_sample_rate);

    let audio_bridge = Arc::new(AudioBridge::new(&config, tx_audio_event).await?);
    let audio_bridge_clone = audio_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = audio_bridge_clone.run().await {
            log::error!("AudioBridge error: {:#}", e);
        }
    });

    log::info!("Meeting voice relay started");

    let mut link_finished = false;
    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break Ok(());
            }

            result = &mut link_task => {
                link_finished = true;
                break match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(anyhow!("Session link task failed: {}", e)),
                };
            }

            Some(event) = rx_net_event.recv() => match event {
                NetEvent::Text(text) => controller.handle_server_text(&text),
                NetEvent::Connected => log::info!("Session connected"),
                NetEvent::Disconnected => log::warn!("Session disconnected"),
                NetEvent::Reset => controller.reset(),
            },

            Some(event) = rx_audio_event.recv() => match event {
                AudioEvent::Frame(frame) => {
                    // echo guard: drop capture while the bot is talking
                    if config.audio.mute_while_speaking && controller.is_speaking() {
                        uplink.mute();
                    } else {
                        uplink.on_frame(&frame);
                    }
                }
                AudioEvent::MeetingEnded => {
                    log::info!("Meeting ended, shutting down...");
                    link.close();
                    break Ok(());
                }
            },
        }
    };

    if !link_finished {
        link.shutdown();
        match timeout(Duration::from_secs(5), &mut link_task).await {
            Ok(Ok(Err(e))) => log::warn!("Session link ended with error: {}", e),
            Ok(Err(e)) => log::warn!("Session link task failed: {}", e),
            Err(_) => log::warn!("Session link did not stop in time"),
            Ok(Ok(Ok(()))) => {}
        }
    }

    let up = uplink.stats();
    let down = controller.stats();
    log::info!(
        "Uplink: {} frames / {} bytes sent, {} offline, {} muted, {} thinned, {} send failures",
        up.frames_sent,
        up.bytes_sent,
        up.dropped_offline,
        up.dropped_muted,
        up.thinned,
        up.send_failures
    );
    log::info!(
        "Downlink: {} deltas, {} enqueued, {} discarded, {} malformed; playback delivered {}, dropped {}",
        down.deltas,
        down.enqueued,
        down.discarded,
        down.malformed,
        playback.delivered(),
        playback.dropped()
    );

    outcome
}
