use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::audio::{AudioCapture, AudioPlayback, ChunkQueue};
use crate::config::SatelliteConfig;
use crate::detector::{PipelineConfig, WakeWordPipeline};
use crate::models::ModelLoader;
use crate::ring::Ring;
use crate::satellite::Satellite;
use crate::server;
use crate::vad::VoiceGate;
use crate::SAMPLE_RATE;

/// Processor sleep when the chunk queue is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(30);

/// Debug recorder depth.
const DEBUG_RING_SECONDS: usize = 30;

/// Lifecycle notifications for a surrounding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    Started,
    Stopped,
    ListeningStarted,
    ListeningStopped,
}

/// Commands a surrounding UI may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    DebugRecordStart,
    DebugPlay,
}

/// Fan-out of lifecycle events to any number of subscribers. Subscribers
/// that went away are dropped on the next publish.
pub struct EventBus {
    listeners: Mutex<Vec<Sender<UiEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<UiEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: UiEvent) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|listener| listener.send(event).is_ok());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling snapshot of captured audio for the debug commands.
pub struct DebugRecorder {
    ring: Ring<i16>,
    active: bool,
}

impl DebugRecorder {
    pub fn new() -> Self {
        Self {
            ring: Ring::new(DEBUG_RING_SECONDS * SAMPLE_RATE as usize),
            active: false,
        }
    }

    pub fn start(&mut self) {
        self.ring.clear();
        self.active = true;
    }

    pub fn observe(&mut self, chunk: &[i16]) {
        if self.active {
            self.ring.extend(chunk.iter().copied());
        }
    }

    /// Stop recording and hand back everything captured, oldest first.
    pub fn take(&mut self) -> Vec<i16> {
        self.active = false;
        let samples = self.ring.snapshot_tail(self.ring.len());
        self.ring.clear();
        samples
    }
}

impl Default for DebugRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns every component and the long-lived threads.
pub struct Supervisor {
    running: Arc<AtomicBool>,
    events: Arc<EventBus>,
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,
    recorder: Arc<Mutex<DebugRecorder>>,
    processor: Option<JoinHandle<WakeWordPipeline>>,
    server: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Build the full component graph and bring the satellite up. Any
    /// failure here aborts startup; nothing is left half-running.
    pub fn start(config: SatelliteConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let loader = ModelLoader::new(&config.builtin_model_dir, &config.user_model_dir);
        let sessions = loader
            .load(&config.selected_model)
            .context("model load failed")?;
        let pipeline_config = PipelineConfig {
            threshold: config.threshold,
            ..PipelineConfig::default()
        };
        let pipeline = WakeWordPipeline::new(sessions, pipeline_config)
            .context("pipeline construction failed")?;
        let gate = VoiceGate::new(config.vad_mode, config.rms_silence_threshold);

        let listener = server::bind(config.server_port)?;

        let events = Arc::new(EventBus::new());
        let queue = Arc::new(ChunkQueue::default());
        let capture = Arc::new(AudioCapture::new(Arc::clone(&queue)));
        let playback = Arc::new(AudioPlayback::new());
        let recorder = Arc::new(Mutex::new(DebugRecorder::new()));
        let satellite = Arc::new(Satellite::new(
            config.clone(),
            Arc::clone(&capture),
            Arc::clone(&playback),
            Arc::clone(&events),
        ));

        capture
            .start()
            .context("microphone capture failed to start")?;

        let running = Arc::new(AtomicBool::new(true));

        let processor = {
            let satellite = Arc::clone(&satellite);
            let queue = Arc::clone(&queue);
            let recorder = Arc::clone(&recorder);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("processor".to_string())
                .spawn(move || run_processor(satellite, pipeline, gate, queue, recorder, running))
                .context("failed to spawn processor thread")?
        };

        let server = {
            let satellite = Arc::clone(&satellite);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("server-accept".to_string())
                .spawn(move || server::run(listener, satellite, running))
                .context("failed to spawn server thread")?
        };

        events.publish(UiEvent::Started);
        info!(port = config.server_port, "satellite started");

        Ok(Self {
            running,
            events,
            capture,
            playback,
            recorder,
            processor: Some(processor),
            server: Some(server),
        })
    }

    pub fn subscribe(&self) -> Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn command(&self, command: UiCommand) {
        match command {
            UiCommand::DebugRecordStart => {
                info!("debug recording started");
                self.recorder.lock().unwrap().start();
            }
            UiCommand::DebugPlay => self.debug_play(),
        }
    }

    /// Play the debug ring back verbatim through the speaker. Capture is
    /// paused for the duration so the recording does not re-enter the mic.
    fn debug_play(&self) {
        let samples = self.recorder.lock().unwrap().take();
        if samples.is_empty() {
            warn!("debug play requested with nothing recorded");
            return;
        }

        let _ = self.capture.stop();
        match self.playback.setup(SAMPLE_RATE, 1, 2) {
            Ok(()) => {
                let mut bytes = Vec::with_capacity(samples.len() * 2);
                for sample in &samples {
                    bytes.extend_from_slice(&sample.to_le_bytes());
                }
                let _ = self.playback.enqueue(&bytes);
                if let Err(err) = self.playback.drain_and_close() {
                    warn!(error = %err, "debug playback failed");
                }
            }
            Err(err) => warn!(error = %err, "debug playback setup failed"),
        }
        if let Err(err) = self.capture.start() {
            warn!(error = %err, "failed to resume capture after debug play");
        }
    }

    /// Tear everything down: capture, processor, server, pipeline, in that
    /// order, then announce `Stopped`.
    pub fn shutdown(mut self) -> Result<()> {
        info!("satellite shutting down");

        let _ = self.capture.stop();
        self.playback.request_shutdown();

        self.running.store(false, Ordering::SeqCst);
        let pipeline = self
            .processor
            .take()
            .and_then(|handle| handle.join().ok());

        if let Some(server) = self.server.take() {
            let _ = server.join();
        }

        // Model sessions are released here, after the server is gone.
        drop(pipeline);

        self.events.publish(UiEvent::Stopped);
        info!("satellite stopped");
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // A dropped supervisor still stops its threads; `shutdown` is the
        // orderly path.
        self.running.store(false, Ordering::SeqCst);
        self.playback.request_shutdown();
        if let Some(processor) = self.processor.take() {
            let _ = processor.join();
        }
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

fn run_processor(
    satellite: Arc<Satellite>,
    mut pipeline: WakeWordPipeline,
    mut gate: VoiceGate,
    queue: Arc<ChunkQueue>,
    recorder: Arc<Mutex<DebugRecorder>>,
    running: Arc<AtomicBool>,
) -> WakeWordPipeline {
    debug!("processor running");
    while running.load(Ordering::SeqCst) {
        match queue.pop() {
            Some(chunk) => {
                recorder.lock().unwrap().observe(&chunk);
                satellite.handle_chunk(&chunk, &mut pipeline, &mut gate);
            }
            None => std::thread::sleep(IDLE_SLEEP),
        }
    }
    debug!("processor exited");
    // Handed back to the supervisor so the sessions outlive the server.
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus_fan_out() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(UiEvent::Started);
        assert_eq!(a.recv().unwrap(), UiEvent::Started);
        assert_eq!(b.recv().unwrap(), UiEvent::Started);

        // A dropped subscriber does not wedge later publishes
        drop(a);
        bus.publish(UiEvent::Stopped);
        assert_eq!(b.recv().unwrap(), UiEvent::Stopped);
    }

    #[test]
    fn test_debug_recorder_inactive_by_default() {
        let mut recorder = DebugRecorder::new();
        recorder.observe(&[1, 2, 3]);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_debug_recorder_captures_between_start_and_take() {
        let mut recorder = DebugRecorder::new();
        recorder.start();
        recorder.observe(&[1, 2]);
        recorder.observe(&[3]);

        assert_eq!(recorder.take(), vec![1, 2, 3]);
        // take() stops the recording
        recorder.observe(&[4]);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_debug_recorder_bounded() {
        let mut recorder = DebugRecorder::new();
        recorder.start();
        let capacity = DEBUG_RING_SECONDS * SAMPLE_RATE as usize;
        recorder.observe(&vec![7i16; capacity + 100]);
        assert_eq!(recorder.take().len(), capacity);
    }
}
