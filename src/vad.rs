use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::VadMode;

/// Samples per VAD frame (20ms at 16kHz).
pub const VAD_FRAME_SIZE: usize = 320;

/// A gate call slower than this is logged; the processor budget is one hop.
const SLOW_CALL: Duration = Duration::from_millis(80);

/// Cheap speech predicate that decides whether a captured chunk is worth
/// running through the wake-word pipeline.
pub enum VoiceGate {
    Energy(EnergyGate),
    Frame(FrameGate),
}

impl VoiceGate {
    pub fn new(mode: VadMode, rms_threshold: f32) -> Self {
        match mode {
            VadMode::Energy => VoiceGate::Energy(EnergyGate::new(rms_threshold)),
            VadMode::Frame => VoiceGate::Frame(FrameGate::new(rms_threshold)),
        }
    }

    /// True when the chunk contains speech.
    pub fn is_speech(&mut self, chunk: &[i16]) -> bool {
        let start = Instant::now();
        let speech = match self {
            VoiceGate::Energy(gate) => gate.is_speech(chunk),
            VoiceGate::Frame(gate) => gate.push(chunk).into_iter().any(|frame| frame),
        };
        let elapsed = start.elapsed();
        if elapsed > SLOW_CALL {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "slow VAD call");
        }
        speech
    }

    pub fn reset(&mut self) {
        if let VoiceGate::Frame(gate) = self {
            gate.reset();
        }
    }
}

/// Root-mean-square of the chunk, normalized to [0, 1], against a fixed
/// threshold. Stateless.
pub struct EnergyGate {
    threshold: f32,
}

impl EnergyGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn is_speech(&self, chunk: &[i16]) -> bool {
        rms(chunk) > self.threshold
    }
}

/// Frame-granular gate: fixed 320-sample frames with carry-over of the tail
/// across calls, so chunk boundaries do not shift frame boundaries.
pub struct FrameGate {
    threshold: f32,
    tail: Vec<i16>,
}

impl FrameGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            tail: Vec::with_capacity(VAD_FRAME_SIZE),
        }
    }

    /// Feed samples and return one decision per completed frame. Incomplete
    /// trailing samples are carried to the next call; the tail never reaches
    /// a full frame.
    pub fn push(&mut self, chunk: &[i16]) -> Vec<bool> {
        let mut samples = std::mem::take(&mut self.tail);
        samples.extend_from_slice(chunk);

        let mut decisions = Vec::with_capacity(samples.len() / VAD_FRAME_SIZE);
        let mut offset = 0;
        while offset + VAD_FRAME_SIZE <= samples.len() {
            let frame = &samples[offset..offset + VAD_FRAME_SIZE];
            decisions.push(rms(frame) > self.threshold);
            offset += VAD_FRAME_SIZE;
        }

        self.tail.extend_from_slice(&samples[offset..]);
        decisions
    }

    pub fn reset(&mut self) {
        self.tail.clear();
    }
}

/// RMS energy of PCM samples, normalized to [0, 1].
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let f = f64::from(s) / 32768.0;
            f * f
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn test_rms_silence_and_tone() {
        assert!(rms(&vec![0i16; 1280]) < 1e-6);
        assert!(rms(&tone(8192, 1280)) > 0.2);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_energy_gate() {
        let gate = EnergyGate::new(0.01);
        assert!(!gate.is_speech(&vec![0i16; 1280]));
        assert!(gate.is_speech(&tone(4096, 1280)));
    }

    #[test]
    fn test_frame_gate_carry_over_matches_concatenation() {
        // 3 frames of tone then 2 frames of silence, fed as odd-sized pieces
        let mut signal = tone(4096, VAD_FRAME_SIZE * 3);
        signal.extend(vec![0i16; VAD_FRAME_SIZE * 2]);

        let mut whole = FrameGate::new(0.01);
        let expected = whole.push(&signal);

        let mut split = FrameGate::new(0.01);
        let mut got = Vec::new();
        for piece in signal.chunks(VAD_FRAME_SIZE + 77) {
            got.extend(split.push(piece));
        }

        assert_eq!(expected, got);
        assert_eq!(expected, vec![true, true, true, false, false]);
    }

    #[test]
    fn test_frame_gate_tail_stays_short() {
        let mut gate = FrameGate::new(0.01);
        gate.push(&tone(1000, VAD_FRAME_SIZE + 123));
        assert_eq!(gate.tail.len(), 123);

        gate.push(&tone(1000, VAD_FRAME_SIZE - 1));
        assert!(gate.tail.len() < VAD_FRAME_SIZE);
    }

    #[test]
    fn test_gate_any_frame_speech() {
        let mut gate = VoiceGate::new(VadMode::Frame, 0.01);
        let mut chunk = vec![0i16; VAD_FRAME_SIZE * 2];
        chunk.extend(tone(8192, VAD_FRAME_SIZE));
        assert!(gate.is_speech(&chunk));
        assert!(!gate.is_speech(&vec![0i16; VAD_FRAME_SIZE * 4]));
    }
}
