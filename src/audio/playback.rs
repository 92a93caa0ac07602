//! Ordered playback of synthesized audio into the virtual microphone.
//!
//! Chunks drain strictly FIFO, one delivery at a time. Only one drain runs
//! at a time; enqueueing while a drain is active just appends. The queue
//! state is never locked across the sink's await point.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;

/// Outcome of handing one chunk to the virtual microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The chunk was played out completely.
    Played,
    /// The meeting (or the page hosting it) is gone; nothing more can play.
    SinkGone,
}

/// The device the meeting hears as our microphone.
#[async_trait]
pub trait VirtualMic: Send + Sync {
    /// Play `samples` (mono, meeting rate) and resolve once they are done.
    async fn play(&self, samples: &[f32]) -> Result<Delivery>;
}

struct QueueState {
    chunks: VecDeque<Vec<f32>>,
    draining: bool,
    accepting: bool,
    sink_live: bool,
    overflowing: bool,
    delivered: u64,
    dropped: u64,
}

pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    sink: Arc<dyn VirtualMic>,
    max_chunks: usize,
}

impl PlaybackQueue {
    pub fn new(sink: Arc<dyn VirtualMic>, max_chunks: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                draining: false,
                accepting: true,
                sink_live: true,
                overflowing: false,
                delivered: 0,
                dropped: 0,
            }),
            sink,
            max_chunks: max_chunks.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue only if the accept gate is open and the sink is still live.
    /// Returns whether the chunk was taken.
    pub fn offer(self: &Arc<Self>, chunk: Vec<f32>) -> bool {
        {
            let state = self.lock();
            if !state.accepting || !state.sink_live {
                return false;
            }
        }
        self.enqueue(chunk);
        true
    }

    /// Append to the tail and make sure a drain is running.
    pub fn enqueue(self: &Arc<Self>, chunk: Vec<f32>) {
        let start_drain = {
            let mut state = self.lock();
            if state.chunks.len() >= self.max_chunks {
                state.chunks.pop_front();
                state.dropped += 1;
                if !state.overflowing {
                    state.overflowing = true;
                    log::warn!(
                        "Playback queue full ({} chunks), dropping oldest audio",
                        self.max_chunks
                    );
                }
            }
            state.chunks.push_back(chunk);
            !state.draining
        };

        if start_drain {
            tokio::spawn(Arc::clone(self).drain());
        }
    }

    /// Deliver queued chunks until the queue is empty. No-op if a drain is
    /// already in progress or there is nothing to play.
    pub async fn drain(self: Arc<Self>) {
        {
            let mut state = self.lock();
            if state.draining || state.chunks.is_empty() {
                return;
            }
            state.draining = true;
        }
        self.run_drain().await;
    }

    async fn run_drain(&self) {
        loop {
            // Popping under the lock is the cancellation check: an interrupt
            // that cleared the queue mid-delivery leaves nothing to pop.
            let chunk = {
                let mut state = self.lock();
                match state.chunks.pop_front() {
                    Some(chunk) => chunk,
                    None => {
                        state.draining = false;
                        state.accepting = true;
                        state.overflowing = false;
                        return;
                    }
                }
            };

            match self.sink.play(&chunk).await {
                Ok(Delivery::Played) => {
                    self.lock().delivered += 1;
                }
                Ok(Delivery::SinkGone) => {
                    let mut state = self.lock();
                    let discarded = state.chunks.len();
                    state.chunks.clear();
                    state.draining = false;
                    state.sink_live = false;
                    log::warn!(
                        "Virtual microphone is gone, discarded {} queued chunks",
                        discarded
                    );
                    return;
                }
                Err(e) => {
                    log::warn!("Virtual microphone failed to play chunk: {:#}", e);
                }
            }
        }
    }

    /// `response.audio.done`: stop taking chunks, but let the queued ones
    /// drain. The gate reopens once the queue runs dry.
    pub fn finish_response(&self) {
        let mut state = self.lock();
        state.accepting = state.chunks.is_empty() && !state.draining;
    }

    /// Drop everything not yet delivered and close the gate.
    pub fn interrupt(&self) -> usize {
        let mut state = self.lock();
        let discarded = state.chunks.len();
        state.chunks.clear();
        state.accepting = false;
        discarded
    }

    /// Back to the initial state: empty, accepting, sink assumed live.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.chunks.clear();
        state.accepting = true;
        state.sink_live = true;
        state.overflowing = false;
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    #[cfg(test)]
    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    #[cfg(test)]
    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    pub fn is_sink_live(&self) -> bool {
        self.lock().sink_live
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
