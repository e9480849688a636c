//! Microphone capture: a fixed-size frame accumulator running on its own
//! OS thread.
//!
//! Runs on a std::thread, not a tokio task. The only link back to the async
//! side is a one-way channel of owned frames; the ring buffer itself never
//! leaves the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;

use super::pcm;
use super::source::AudioSource;

pub const DEFAULT_CAPTURE_BUFFER_SIZE: usize = 4096;

/// Samples per channel handed to the worker per callback (one render quantum).
pub const DEFAULT_BLOCK_FRAMES: usize = 128;

/// A completed capture buffer, handed from the audio thread to the session.
///
/// Serializes as `{"type": "audio-data", "audioData": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "audio-data")]
pub struct AudioFrame {
    #[serde(rename = "audioData")]
    pub audio_data: Vec<f32>,
}

/// Accumulates incoming sample blocks into frames of constant size.
pub struct CaptureWorker {
    buffer: Vec<f32>,
    cursor: usize,
    tx: mpsc::UnboundedSender<AudioFrame>,
}

impl CaptureWorker {
    pub fn new(buffer_size: usize, tx: mpsc::UnboundedSender<AudioFrame>) -> Self {
        Self {
            buffer: vec![0.0; buffer_size.max(1)],
            cursor: 0,
            tx,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Samples waiting in the buffer.
    pub fn pending(&self) -> usize {
        self.cursor
    }

    /// Called once per audio block with the channels of the first input.
    /// Only the first channel is captured. Always returns `true` (keep
    /// processing).
    pub fn process(&mut self, input: &[&[f32]]) -> bool {
        let Some(channel) = input.first() else {
            return true;
        };

        for &sample in channel.iter() {
            self.buffer[self.cursor] = sample;
            self.cursor += 1;

            if self.cursor >= self.buffer.len() {
                self.emit(self.buffer.len());
            }
        }
        true
    }

    /// Emit whatever is buffered as a short frame. Returns whether a frame
    /// was sent.
    pub fn flush_partial(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.emit(self.cursor);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn emit(&mut self, len: usize) {
        let frame = AudioFrame {
            audio_data: self.buffer[..len].to_vec(),
        };
        // Receiver gone means the session is shutting down; the thread
        // notices through `is_closed`.
        let _ = self.tx.send(frame);
        self.cursor = 0;
    }
}

/// Capture thread configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Frame size handed to the session.
    pub buffer_size: usize,
    /// Samples per channel read from the source per callback.
    pub block_frames: usize,
    /// Sleep for the duration of each block, pacing file sources like a
    /// live microphone.
    pub realtime: bool,
    /// Average stereo input to mono before capture instead of taking the
    /// first channel.
    pub downmix: bool,
    /// Emit the partial final frame on stop instead of dropping it.
    pub flush_on_stop: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_CAPTURE_BUFFER_SIZE,
            block_frames: DEFAULT_BLOCK_FRAMES,
            realtime: false,
            downmix: true,
            flush_on_stop: false,
        }
    }
}

/// Owns the capture thread.
///
/// - Capture thread: `AudioSource` → deinterleave/downmix → `CaptureWorker` → `frame_tx`
pub struct CaptureSystem {
    running: Arc<AtomicBool>,
    sample_rate: u32,
    handle: Option<JoinHandle<()>>,
}

impl CaptureSystem {
    /// Start capturing from `source`. Frames arrive on `frame_tx`; the
    /// channel closes when the source is exhausted or `stop` is called.
    pub fn start(
        config: CaptureConfig,
        source: Box<dyn AudioSource>,
        frame_tx: mpsc::UnboundedSender<AudioFrame>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let sample_rate = source.sample_rate();

        log::info!(
            "CaptureSystem starting: rate={}Hz, ch={}, buffer={}, block={}",
            sample_rate,
            source.channels(),
            config.buffer_size,
            config.block_frames,
        );

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    if let Err(e) = capture_thread(&config, source, frame_tx, &running) {
                        log::error!("Capture thread error: {}", e);
                    }
                })?
        };

        Ok(Self {
            running,
            sample_rate,
            handle: Some(handle),
        })
    }

    /// Sample rate of the frames this system produces.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Signal the thread to stop and wait for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CaptureSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    config: &CaptureConfig,
    mut source: Box<dyn AudioSource>,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    running: &AtomicBool,
) -> Result<()> {
    let channels = source.channels().max(1) as usize;
    let block_frames = config.block_frames.max(1);
    let block_duration =
        Duration::from_secs_f64(pcm::duration_secs(block_frames, source.sample_rate()));

    let mut worker = CaptureWorker::new(config.buffer_size, frame_tx);

    // Interleaved read buffer, one block
    let mut read_buf = vec![0.0f32; block_frames * channels];
    // Per-channel buffers for splitting interleaved data
    let mut channel_buffers: Vec<Vec<f32>> = (0..channels).map(|_| vec![0.0; block_frames]).collect();

    while running.load(Ordering::Relaxed) {
        let n = source.read(&mut read_buf)?;
        if n == 0 {
            log::info!("Capture source exhausted");
            break;
        }
        let frames = n / channels;

        // Split interleaved → per-channel
        for i in 0..frames {
            for ch in 0..channels {
                channel_buffers[ch][i] = read_buf[i * channels + ch];
            }
        }

        if config.downmix && channels == 2 {
            let mono = pcm::stereo_to_mono(&channel_buffers[0][..frames], &channel_buffers[1][..frames]);
            worker.process(&[mono.as_slice()]);
        } else {
            let block: Vec<&[f32]> = channel_buffers.iter().map(|c| &c[..frames]).collect();
            worker.process(&block);
        }

        if worker.is_closed() {
            log::warn!("Frame receiver dropped, stopping capture");
            return Ok(());
        }

        if config.realtime {
            thread::sleep(block_duration);
        }
    }

    if config.flush_on_stop {
        worker.flush_partial();
    } else if worker.pending() > 0 {
        log::debug!("Dropping {} buffered samples on stop", worker.pending());
    }

    log::info!("Capture stopped");
    Ok(())
}
