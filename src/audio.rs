use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{CHUNK_SIZE, SAMPLE_RATE};

/// Audio-processing queue depth: 10s of 80ms chunks.
pub const QUEUE_CAPACITY_CHUNKS: usize = 125;

/// How long a playback drain keeps waiting after shutdown is requested.
const DRAIN_ABORT: Duration = Duration::from_millis(200);
const DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no playback stream is open")]
    NotInitialized,

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio subsystem is closed")]
    Closed,
}

/// Bounded queue of captured chunks between the capture thread and the
/// processor. Overflow drops the oldest chunk so a stalled processor never
/// blocks capture.
pub struct ChunkQueue {
    inner: Mutex<VecDeque<Vec<i16>>>,
    capacity: usize,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, chunk: Vec<i16>) {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() == self.capacity {
            queue.pop_front();
            warn!("audio queue full, dropping oldest chunk");
        }
        queue.push_back(chunk);
    }

    pub fn pop(&self) -> Option<Vec<i16>> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY_CHUNKS)
    }
}

enum CaptureCommand {
    Start(SyncSender<Result<(), AudioError>>),
    Stop(SyncSender<()>),
    Shutdown,
}

/// Microphone capture: a control thread owns the cpal input stream (cpal
/// streams are not `Send`) and forwards whole 1280-sample chunks into the
/// processing queue.
pub struct AudioCapture {
    tx: Sender<CaptureCommand>,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioCapture {
    pub fn new(queue: Arc<ChunkQueue>) -> Self {
        let (tx, rx) = mpsc::channel::<CaptureCommand>();
        let active = Arc::new(AtomicBool::new(false));
        let active_thread = Arc::clone(&active);

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let mut stream: Option<cpal::Stream> = None;
                while let Ok(command) = rx.recv() {
                    match command {
                        CaptureCommand::Start(ack) => {
                            if stream.is_some() {
                                warn!("capture already active, ignoring start");
                                let _ = ack.send(Ok(()));
                                continue;
                            }
                            let result = build_capture_stream(Arc::clone(&queue));
                            let _ = ack.send(match result {
                                Ok(built) => {
                                    stream = Some(built);
                                    active_thread.store(true, Ordering::SeqCst);
                                    info!("capture started");
                                    Ok(())
                                }
                                Err(err) => Err(err),
                            });
                        }
                        CaptureCommand::Stop(ack) => {
                            // Dropping the stream closes the device handle; a
                            // trailing partial chunk dies with the callback.
                            if stream.take().is_some() {
                                info!("capture stopped");
                            }
                            active_thread.store(false, Ordering::SeqCst);
                            let _ = ack.send(());
                        }
                        CaptureCommand::Shutdown => break,
                    }
                }
                drop(stream);
            })
            .expect("failed to spawn capture thread");

        Self {
            tx,
            active,
            thread: Some(thread),
        }
    }

    /// Begin delivering chunks to the queue. Idempotent.
    pub fn start(&self) -> Result<(), AudioError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(CaptureCommand::Start(ack_tx))
            .map_err(|_| AudioError::Closed)?;
        ack_rx.recv().map_err(|_| AudioError::Closed)?
    }

    /// Stop capture; no chunks are delivered after this returns.
    pub fn stop(&self) -> Result<(), AudioError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(CaptureCommand::Stop(ack_tx))
            .map_err(|_| AudioError::Closed)?;
        ack_rx.recv().map_err(|_| AudioError::Closed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        let _ = self.tx.send(CaptureCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_capture_stream(queue: Arc<ChunkQueue>) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::Device("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|err| AudioError::Device(err.to_string()))?
        .filter(|c| c.channels() == 1)
        .find(|c| {
            c.sample_format() == SampleFormat::I16
                && c.min_sample_rate().0 <= SAMPLE_RATE
                && c.max_sample_rate().0 >= SAMPLE_RATE
        })
        .map(|c| c.with_sample_rate(SampleRate(SAMPLE_RATE)));

    let err_fn = |err| warn!(error = %err, "capture stream error");
    let mut buffer: Vec<i16> = Vec::with_capacity(CHUNK_SIZE * 2);

    let stream = match supported {
        Some(config) => {
            debug!("capturing in native i16");
            device
                .build_input_stream(
                    &config.config(),
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        buffer.extend_from_slice(data);
                        while buffer.len() >= CHUNK_SIZE {
                            let chunk: Vec<i16> = buffer.drain(..CHUNK_SIZE).collect();
                            queue.push(chunk);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|err| AudioError::Device(err.to_string()))?
        }
        None => {
            // Some devices only expose f32; convert in the callback.
            debug!("capturing in f32 with conversion");
            let config = StreamConfig {
                channels: 1,
                sample_rate: SampleRate(SAMPLE_RATE),
                buffer_size: cpal::BufferSize::Default,
            };
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        buffer.extend(
                            data.iter()
                                .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16),
                        );
                        while buffer.len() >= CHUNK_SIZE {
                            let chunk: Vec<i16> = buffer.drain(..CHUNK_SIZE).collect();
                            queue.push(chunk);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|err| AudioError::Device(err.to_string()))?
        }
    };

    stream
        .play()
        .map_err(|err| AudioError::Device(err.to_string()))?;
    Ok(stream)
}

/// Sample widths and channel counts the playback path accepts directly.
const SUPPORTED_FORMATS: [(u16, u16); 4] = [(1, 1), (1, 2), (2, 1), (2, 2)];

/// Clamp an inbound (channels, width) pair to a supported one.
fn normalize_format(channels: u16, width: u16) -> (u16, u16) {
    if SUPPORTED_FORMATS.contains(&(channels, width)) {
        (channels, width)
    } else {
        warn!(channels, width, "unsupported playback format, using mono 16-bit");
        (1, 2)
    }
}

/// Decode one PCM sample from the byte queue front. Width 1 is unsigned
/// 8-bit, width 2 signed 16-bit little-endian.
fn pop_sample(queue: &mut VecDeque<u8>, width: u16) -> Option<f32> {
    match width {
        1 => queue
            .pop_front()
            .map(|b| (f32::from(b) - 128.0) / 128.0),
        _ => {
            if queue.len() < 2 {
                return None;
            }
            let lo = queue.pop_front()?;
            let hi = queue.pop_front()?;
            Some(f32::from(i16::from_le_bytes([lo, hi])) / 32768.0)
        }
    }
}

struct PlaybackShared {
    bytes: Mutex<VecDeque<u8>>,
    drained: Condvar,
}

enum PlaybackCommand {
    Setup {
        rate: u32,
        channels: u16,
        width: u16,
        ack: SyncSender<Result<(), AudioError>>,
    },
    Close(SyncSender<()>),
    Shutdown,
}

/// Speaker playback: a control thread owns the cpal output stream, the
/// callback drains a shared PCM byte queue.
pub struct AudioPlayback {
    tx: Sender<PlaybackCommand>,
    shared: Arc<PlaybackShared>,
    open: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    rate: Mutex<u32>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    pub fn new() -> Self {
        let shared = Arc::new(PlaybackShared {
            bytes: Mutex::new(VecDeque::new()),
            drained: Condvar::new(),
        });
        let open = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<PlaybackCommand>();

        let shared_thread = Arc::clone(&shared);
        let open_thread = Arc::clone(&open);
        let thread = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let mut stream: Option<cpal::Stream> = None;
                while let Ok(command) = rx.recv() {
                    match command {
                        PlaybackCommand::Setup {
                            rate,
                            channels,
                            width,
                            ack,
                        } => {
                            stream = None;
                            let result =
                                build_playback_stream(Arc::clone(&shared_thread), rate, channels, width);
                            let _ = ack.send(match result {
                                Ok(built) => {
                                    stream = Some(built);
                                    open_thread.store(true, Ordering::SeqCst);
                                    info!(rate, channels, width, "playback stream open");
                                    Ok(())
                                }
                                Err(err) => Err(err),
                            });
                        }
                        PlaybackCommand::Close(ack) => {
                            if stream.take().is_some() {
                                debug!("playback stream closed");
                            }
                            open_thread.store(false, Ordering::SeqCst);
                            let _ = ack.send(());
                        }
                        PlaybackCommand::Shutdown => break,
                    }
                }
                drop(stream);
            })
            .expect("failed to spawn playback thread");

        Self {
            tx,
            shared,
            open,
            shutting_down: Arc::new(AtomicBool::new(false)),
            rate: Mutex::new(SAMPLE_RATE),
            thread: Some(thread),
        }
    }

    /// Open an output stream in the requested format. Unsupported
    /// (channels, width) pairs fall back to mono 16-bit.
    pub fn setup(&self, rate: u32, channels: u16, width: u16) -> Result<(), AudioError> {
        let (channels, width) = normalize_format(channels, width);
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(PlaybackCommand::Setup {
                rate,
                channels,
                width,
                ack: ack_tx,
            })
            .map_err(|_| AudioError::Closed)?;
        ack_rx.recv().map_err(|_| AudioError::Closed)??;
        *self.rate.lock().unwrap() = rate;
        self.shared.bytes.lock().unwrap().clear();
        Ok(())
    }

    /// Append raw PCM bytes to the open stream.
    pub fn enqueue(&self, bytes: &[u8]) -> Result<(), AudioError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AudioError::NotInitialized);
        }
        self.shared.bytes.lock().unwrap().extend(bytes.iter().copied());
        Ok(())
    }

    /// Block until the queued audio has played out, then close the stream.
    /// Idempotent; aborts early when shutdown has been requested.
    pub fn drain_and_close(&self) -> Result<(), AudioError> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Drain budget: queued bytes at the stream rate, plus slack. The
        // callback consumes the queue even if the device runs a little slow.
        let rate = (*self.rate.lock().unwrap()).max(1);
        {
            let queued = self.shared.bytes.lock().unwrap().len();
            let budget = Duration::from_millis(1000 * queued as u64 / (2 * u64::from(rate)) + 1000);
            let deadline = Instant::now() + budget;
            let mut bytes = self.shared.bytes.lock().unwrap();
            let mut shutdown_seen: Option<Instant> = None;
            while !bytes.is_empty() {
                if self.shutting_down.load(Ordering::SeqCst) {
                    let seen = shutdown_seen.get_or_insert_with(Instant::now);
                    if seen.elapsed() >= DRAIN_ABORT {
                        debug!("drain aborted by shutdown");
                        break;
                    }
                } else if Instant::now() >= deadline {
                    warn!(remaining = bytes.len(), "drain deadline reached");
                    break;
                }
                let (guard, _timeout) = self
                    .shared
                    .drained
                    .wait_timeout(bytes, DRAIN_POLL)
                    .unwrap();
                bytes = guard;
            }
        }

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(PlaybackCommand::Close(ack_tx))
            .map_err(|_| AudioError::Closed)?;
        ack_rx.recv().map_err(|_| AudioError::Closed)
    }

    /// Discard queued playback immediately; the stream stays open.
    pub fn interrupt(&self) {
        self.shared.bytes.lock().unwrap().clear();
        self.shared.drained.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Make any in-flight drain abort promptly.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shared.drained.notify_all();
    }
}

impl Default for AudioPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.request_shutdown();
        let _ = self.tx.send(PlaybackCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_playback_stream(
    shared: Arc<PlaybackShared>,
    rate: u32,
    channels: u16,
    width: u16,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no output device available".to_string()))?;

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut bytes = shared.bytes.lock().unwrap();
                for slot in data.iter_mut() {
                    *slot = pop_sample(&mut bytes, width).unwrap_or(0.0);
                }
                if bytes.is_empty() {
                    shared.drained.notify_all();
                }
            },
            |err| warn!(error = %err, "playback stream error"),
            None,
        )
        .map_err(|err| AudioError::Device(err.to_string()))?;

    stream
        .play()
        .map_err(|err| AudioError::Device(err.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let queue = ChunkQueue::new(2);
        queue.push(vec![1]);
        queue.push(vec![2]);
        queue.push(vec![3]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(vec![2]));
        assert_eq!(queue.pop(), Some(vec![3]));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_normalize_format_passes_supported_pairs() {
        for (channels, width) in SUPPORTED_FORMATS {
            assert_eq!(normalize_format(channels, width), (channels, width));
        }
    }

    #[test]
    fn test_normalize_format_falls_back_to_mono_16() {
        assert_eq!(normalize_format(6, 2), (1, 2));
        assert_eq!(normalize_format(1, 4), (1, 2));
        assert_eq!(normalize_format(0, 0), (1, 2));
    }

    #[test]
    fn test_pop_sample_decodes_16_bit_le() {
        let mut queue: VecDeque<u8> = VecDeque::new();
        queue.extend(i16::MAX.to_le_bytes());
        queue.extend((-16384i16).to_le_bytes());

        let hi = pop_sample(&mut queue, 2).unwrap();
        assert!((hi - (i16::MAX as f32 / 32768.0)).abs() < 1e-6);
        let lo = pop_sample(&mut queue, 2).unwrap();
        assert!((lo + 0.5).abs() < 1e-6);
        assert_eq!(pop_sample(&mut queue, 2), None);
    }

    #[test]
    fn test_pop_sample_decodes_unsigned_8_bit() {
        let mut queue: VecDeque<u8> = VecDeque::from(vec![128u8, 255, 0]);
        assert!(pop_sample(&mut queue, 1).unwrap().abs() < 1e-6);
        assert!(pop_sample(&mut queue, 1).unwrap() > 0.99);
        assert!((pop_sample(&mut queue, 1).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pop_sample_half_sample_left() {
        let mut queue: VecDeque<u8> = VecDeque::from(vec![0x42]);
        assert_eq!(pop_sample(&mut queue, 2), None);
        // The dangling byte stays queued until its pair arrives
        assert_eq!(queue.len(), 1);
    }
}
