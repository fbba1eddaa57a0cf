use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioCapture, AudioError, AudioPlayback};
use crate::config::SatelliteConfig;
use crate::detector::WakeWordPipeline;
use crate::protocol::{AudioFormat, Event, FrameWriter};
use crate::supervisor::{EventBus, UiEvent};
use crate::vad::VoiceGate;

/// Where the satellite is in the capture/playback duplex cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatelliteState {
    /// Capturing; scoring chunks for the wake word.
    Idle,
    /// Wake word fired with no controller attached; overlay active.
    Listening,
    /// Wake word fired with a controller attached; captured chunks are
    /// forwarded upstream instead of being classified.
    Streaming,
    /// A controller is streaming response audio to the speaker.
    Playing,
}

type Controller = Arc<FrameWriter<TcpStream>>;

/// Coordinates microphone, wake-word pipeline, speaker and controller
/// connection. Chunk scoring runs on the processor thread; inbound protocol
/// events arrive from the connection handler thread.
pub struct Satellite {
    config: SatelliteConfig,
    state: Mutex<SatelliteState>,
    last_detection: Mutex<Option<Instant>>,
    enabled: AtomicBool,
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,
    controller: Mutex<Option<Controller>>,
    events: Arc<EventBus>,
}

impl Satellite {
    pub fn new(
        config: SatelliteConfig,
        capture: Arc<AudioCapture>,
        playback: Arc<AudioPlayback>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(SatelliteState::Idle),
            last_detection: Mutex::new(None),
            enabled: AtomicBool::new(true),
            capture,
            playback,
            controller: Mutex::new(None),
            events,
        }
    }

    pub fn state(&self) -> SatelliteState {
        *self.state.lock().unwrap()
    }

    pub fn config(&self) -> &SatelliteConfig {
        &self.config
    }

    /// One captured chunk from the processing queue. Runs only on the
    /// processor thread; the pipeline and gate live there.
    pub fn handle_chunk(
        &self,
        chunk: &[i16],
        pipeline: &mut WakeWordPipeline,
        gate: &mut VoiceGate,
    ) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        // Never classify speaker output.
        if self.state() == SatelliteState::Playing {
            return;
        }

        let now = Instant::now();
        if self.activation_expired(now) {
            self.deactivate("listening timeout");
        }

        if !gate.is_speech(chunk) {
            // Silence ends an activation early and skips the pipeline.
            self.deactivate("silence");
            return;
        }

        match self.state() {
            SatelliteState::Idle | SatelliteState::Listening => {
                match pipeline.offer(chunk) {
                    Ok(Some(score)) => self.observe_score(score, pipeline.threshold(), now),
                    Ok(None) => {}
                    Err(err) => {
                        // Drop the chunk; ring state is still consistent.
                        warn!(error = %format!("{err:#}"), "inference failed, dropping chunk");
                    }
                }
            }
            SatelliteState::Streaming => self.forward_chunk(chunk),
            SatelliteState::Playing => {}
        }
    }

    fn observe_score(&self, score: f32, threshold: f32, now: Instant) {
        if score <= threshold {
            return;
        }

        match self.state() {
            SatelliteState::Idle => {
                if self.cooldown_elapsed(now) {
                    self.activate(score, now);
                } else {
                    trace!(score, "detection suppressed by cooldown");
                }
            }
            SatelliteState::Listening => {
                // Repeated hits keep the activation alive but never re-fire.
                *self.last_detection.lock().unwrap() = Some(now);
            }
            _ => {}
        }
    }

    fn activate(&self, score: f32, now: Instant) {
        *self.last_detection.lock().unwrap() = Some(now);

        let controller = self.controller.lock().unwrap().clone();
        let next = if controller.is_some() {
            SatelliteState::Streaming
        } else {
            SatelliteState::Listening
        };
        *self.state.lock().unwrap() = next;

        info!(score, state = ?next, "wake word detected");
        self.events.publish(UiEvent::ListeningStarted);

        if let Some(writer) = controller {
            let name = self
                .config
                .selected_model
                .name()
                .trim_end_matches(".onnx")
                .to_string();
            if writer
                .write(&Event::Detection { name: Some(name) }.to_frame())
                .is_err()
            {
                warn!("failed to send detection to controller");
            }
        }
    }

    fn deactivate(&self, reason: &str) {
        let was = {
            let mut state = self.state.lock().unwrap();
            match *state {
                SatelliteState::Listening | SatelliteState::Streaming => {
                    let was = *state;
                    *state = SatelliteState::Idle;
                    was
                }
                _ => return,
            }
        };

        debug!(reason, "activation ended");
        if was == SatelliteState::Streaming {
            if let Some(writer) = self.controller.lock().unwrap().clone() {
                let _ = writer.write(&Event::AudioStop.to_frame());
            }
        }
        self.events.publish(UiEvent::ListeningStopped);
    }

    fn forward_chunk(&self, chunk: &[i16]) {
        let Some(writer) = self.controller.lock().unwrap().clone() else {
            return;
        };
        let event = Event::AudioChunk {
            format: Some(AudioFormat::capture()),
            payload: pcm_bytes(chunk),
        };
        if writer.write(&event.to_frame()).is_err() {
            warn!("controller write failed, ending upstream stream");
            self.deactivate("controller write failed");
        }
    }

    /// One inbound protocol event from the connection handler.
    pub fn handle_event(&self, event: Event, writer: &Controller) {
        match event {
            Event::Describe => {
                if writer
                    .write(&Event::Info(self.info_payload()).to_frame())
                    .is_err()
                {
                    warn!("failed to send info");
                }
            }
            Event::Ping => {
                if writer.write(&Event::Pong.to_frame()).is_err() {
                    warn!("failed to send pong");
                }
            }
            Event::AudioStart(format) => self.begin_playback(format),
            Event::AudioChunk { payload, .. } => match self.playback.enqueue(&payload) {
                Ok(()) => {}
                Err(AudioError::NotInitialized) => {
                    debug!("audio-chunk with no open playback stream, dropped");
                }
                Err(err) => warn!(error = %err, "playback enqueue failed"),
            },
            Event::AudioStop => self.finish_playback(writer),
            Event::RunSatellite => {
                info!("satellite resumed");
                self.enabled.store(true, Ordering::SeqCst);
            }
            Event::PauseSatellite => {
                info!("satellite paused");
                self.deactivate("paused");
                self.enabled.store(false, Ordering::SeqCst);
            }
            Event::Detect => {
                // Detections are always emitted unprompted; nothing to arm.
                debug!("controller requested detect");
            }
            Event::Error { text } => warn!(text, "controller reported an error"),
            Event::Transcribe
            | Event::VoiceStarted
            | Event::VoiceStopped
            | Event::Detection { .. } => {
                trace!("pipeline progress event ignored");
            }
            Event::Info(_) | Event::Pong | Event::Played => {
                trace!("unexpected inbound event ignored");
            }
            Event::Unknown(frame) => {
                debug!(event_type = frame.event_type(), "unknown event ignored");
            }
        }
    }

    fn begin_playback(&self, format: AudioFormat) {
        self.deactivate("playback starting");
        if let Err(err) = self.capture.stop() {
            warn!(error = %err, "failed to stop capture for playback");
        }

        match self
            .playback
            .setup(format.rate, format.channels, format.width)
        {
            Ok(()) => {
                *self.state.lock().unwrap() = SatelliteState::Playing;
                debug!(rate = format.rate, "playback cycle started");
            }
            Err(err) => {
                // Discard this audio-start..audio-stop cycle entirely.
                warn!(error = %err, "playback setup failed, discarding cycle");
                *self.state.lock().unwrap() = SatelliteState::Idle;
                self.resume_capture();
            }
        }
    }

    fn finish_playback(&self, writer: &Controller) {
        let was_playing = {
            let mut state = self.state.lock().unwrap();
            let was = *state == SatelliteState::Playing;
            *state = SatelliteState::Idle;
            was
        };

        if was_playing {
            match self.playback.drain_and_close() {
                Ok(()) => {
                    if writer.write(&Event::Played.to_frame()).is_err() {
                        warn!("failed to send played");
                    }
                }
                Err(err) => warn!(error = %err, "playback drain failed, no played sent"),
            }
        }
        self.resume_capture();
    }

    fn resume_capture(&self) {
        if let Err(err) = self.capture.start() {
            warn!(error = %err, "failed to restart capture");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn attach_controller(&self, writer: Controller) {
        *self.controller.lock().unwrap() = Some(writer);
        debug!("controller attached");
    }

    /// Forget the active controller. A disconnect mid-cycle returns the
    /// satellite to capturing.
    pub fn detach_controller(&self) {
        *self.controller.lock().unwrap() = None;

        let state = self.state();
        match state {
            SatelliteState::Playing => {
                self.playback.interrupt();
                let _ = self.playback.drain_and_close();
                *self.state.lock().unwrap() = SatelliteState::Idle;
                self.resume_capture();
            }
            SatelliteState::Streaming => self.deactivate("controller disconnected"),
            _ => {}
        }
        debug!("controller detached");
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        cooldown_elapsed(
            *self.last_detection.lock().unwrap(),
            now,
            self.config.streaming_timeout(),
        )
    }

    fn activation_expired(&self, now: Instant) -> bool {
        matches!(
            self.state(),
            SatelliteState::Listening | SatelliteState::Streaming
        ) && cooldown_elapsed(
            *self.last_detection.lock().unwrap(),
            now,
            self.config.streaming_timeout(),
        )
    }

    /// The `info` reply to `describe`. Stable across calls for a fixed
    /// configuration.
    pub fn info_payload(&self) -> Value {
        info_payload(&self.config)
    }
}

/// True when `now` is past the cooldown window after the last detection.
/// No detection yet counts as elapsed.
fn cooldown_elapsed(last: Option<Instant>, now: Instant, cooldown: Duration) -> bool {
    match last {
        Some(last) => now.duration_since(last) > cooldown,
        None => true,
    }
}

fn pcm_bytes(chunk: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(chunk.len() * 2);
    for sample in chunk {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

fn info_payload(config: &SatelliteConfig) -> Value {
    json!({
        "asr": [],
        "tts": [],
        "handle": [],
        "intent": [],
        "wake": [],
        "satellite": {
            "name": config.device_name,
            "id": config.device_id,
            "attribution": { "name": "", "url": "" },
            "installed": true,
            "description": format!("{} wake word satellite", config.device_name),
            "version": "1.0",
            "area": null,
            "snd_format": { "channels": 1, "rate": 16000, "width": 2 },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioCapture, AudioPlayback, ChunkQueue};
    use crate::protocol::read_frame;
    use std::io::BufReader;
    use std::net::TcpListener;

    fn test_satellite() -> Satellite {
        let queue = Arc::new(ChunkQueue::default());
        Satellite::new(
            SatelliteConfig::default(),
            Arc::new(AudioCapture::new(queue)),
            Arc::new(AudioPlayback::new()),
            Arc::new(EventBus::new()),
        )
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_ping_answered_with_pong_in_any_state() {
        let satellite = test_satellite();
        let (client, server) = socket_pair();
        let writer = Arc::new(FrameWriter::new(server));
        let mut reader = BufReader::new(client);

        satellite.handle_event(Event::Ping, &writer);
        let reply = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(reply.event_type(), "pong");
        assert_eq!(satellite.state(), SatelliteState::Idle);
    }

    #[test]
    fn test_describe_answered_with_info() {
        let satellite = test_satellite();
        let (client, server) = socket_pair();
        let writer = Arc::new(FrameWriter::new(server));
        let mut reader = BufReader::new(client);

        satellite.handle_event(Event::Describe, &writer);
        let reply = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(reply.event_type(), "info");
        assert_eq!(
            reply.data_json().unwrap()["satellite"]["snd_format"],
            json!({"channels": 1, "rate": 16000, "width": 2})
        );

        // A second describe is byte-identical
        satellite.handle_event(Event::Describe, &writer);
        let again = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(again.data, reply.data);
    }

    #[test]
    fn test_pause_and_run_toggle_processing() {
        let satellite = test_satellite();
        let (_client, server) = socket_pair();
        let writer = Arc::new(FrameWriter::new(server));

        assert!(satellite.is_enabled());
        satellite.handle_event(Event::PauseSatellite, &writer);
        assert!(!satellite.is_enabled());
        satellite.handle_event(Event::RunSatellite, &writer);
        assert!(satellite.is_enabled());
    }

    #[test]
    fn test_stray_audio_chunk_is_dropped() {
        let satellite = test_satellite();
        let (_client, server) = socket_pair();
        let writer = Arc::new(FrameWriter::new(server));

        // No audio-start happened, so there is no stream to feed.
        satellite.handle_event(
            Event::AudioChunk {
                format: None,
                payload: vec![0u8; 2048],
            },
            &writer,
        );
        assert_eq!(satellite.state(), SatelliteState::Idle);
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let satellite = test_satellite();
        let (_client, server) = socket_pair();
        let writer = Arc::new(FrameWriter::new(server));

        let frame = crate::protocol::Frame::with_data("future-event", json!({"x": 1}));
        satellite.handle_event(Event::Unknown(frame), &writer);
        assert_eq!(satellite.state(), SatelliteState::Idle);
    }

    #[test]
    fn test_cooldown_elapsed() {
        let cooldown = Duration::from_secs(60);
        let start = Instant::now();

        assert!(cooldown_elapsed(None, start, cooldown));
        assert!(!cooldown_elapsed(
            Some(start),
            start + Duration::from_secs(59),
            cooldown
        ));
        assert!(!cooldown_elapsed(Some(start), start + cooldown, cooldown));
        assert!(cooldown_elapsed(
            Some(start),
            start + cooldown + Duration::from_millis(1),
            cooldown
        ));
    }

    #[test]
    fn test_info_payload_snd_format() {
        let config = SatelliteConfig::default();
        let payload = info_payload(&config);
        assert_eq!(
            payload["satellite"]["snd_format"],
            json!({ "channels": 1, "rate": 16000, "width": 2 })
        );
        assert_eq!(payload["satellite"]["id"], json!(config.device_id));
        assert_eq!(payload["satellite"]["installed"], json!(true));
        assert_eq!(payload["satellite"]["area"], Value::Null);
        for section in ["asr", "tts", "handle", "intent", "wake"] {
            assert_eq!(payload[section], json!([]));
        }
    }

    #[test]
    fn test_info_payload_stable_across_calls() {
        let config = SatelliteConfig::default();
        let a = serde_json::to_vec(&info_payload(&config)).unwrap();
        let b = serde_json::to_vec(&info_payload(&config)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_pcm_bytes_little_endian() {
        assert_eq!(pcm_bytes(&[0x0102, -2]), vec![0x02, 0x01, 0xfe, 0xff]);
        assert_eq!(pcm_bytes(&[]), Vec::<u8>::new());
    }
}
