use anyhow::{bail, Context, Result};
use ndarray::Array2;
use ort::session::Session;
use ort::value::Tensor;

use crate::ring::Ring;
use crate::{MEL_BINS, MEL_LOOKBACK_SAMPLES, MEL_MIN_SAMPLES, MEL_RING_CAPACITY, RAW_RING_CAPACITY};

/// Number of sentinel mel frames present before any real audio, enough for
/// the first embedding window.
const PRIMING_FRAMES: usize = 76;
const PRIMING_VALUE: f32 = 1.0;

/// Stage A of the pipeline: raw sample intake and the mel-spectrogram model.
///
/// Keeps the last 10s of normalized samples so each model call can prepend
/// 480 samples of lookback for the analysis-window overlap, and the mel
/// output ring the embedding stage windows over.
pub struct Preprocessor {
    melspec: Session,
    raw_ring: Ring<f32>,
    mel_ring: Ring<[f32; MEL_BINS]>,
}

impl Preprocessor {
    pub fn new(melspec: Session) -> Self {
        let mut mel_ring = Ring::new(MEL_RING_CAPACITY);
        for _ in 0..PRIMING_FRAMES {
            mel_ring.push_back([PRIMING_VALUE; MEL_BINS]);
        }

        Self {
            melspec,
            raw_ring: Ring::new(RAW_RING_CAPACITY),
            mel_ring,
        }
    }

    /// Normalize i16 samples to [-1, 1] and append them to the raw ring.
    pub fn push_samples(&mut self, samples: &[i16]) {
        self.raw_ring
            .extend(samples.iter().map(|&s| f32::from(s) / 32768.0));
    }

    pub fn raw_len(&self) -> usize {
        self.raw_ring.len()
    }

    /// True when enough samples have arrived for the mel model to run at all.
    pub fn ready(&self) -> bool {
        self.raw_ring.len() >= MEL_MIN_SAMPLES
    }

    /// Run the mel model over the `new_samples` most recent samples plus 480
    /// samples of lookback. Returns the number of mel frames appended.
    pub fn run(&mut self, new_samples: usize) -> Result<usize> {
        if !self.ready() {
            bail!(
                "mel model needs at least {MEL_MIN_SAMPLES} samples, have {}",
                self.raw_ring.len()
            );
        }

        let window = self
            .raw_ring
            .snapshot_tail(new_samples + MEL_LOOKBACK_SAMPLES);
        let n = window.len();
        let input = Array2::from_shape_vec((1, n), window)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self.melspec.run(ort::inputs![tensor])?;
        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .context("failed to extract melspec output")?;

        // Model emits [1, 1, T, 32]; tolerate a pre-squeezed [1, T, 32].
        let shape = output.shape();
        let (frames, bins) = match shape.len() {
            4 => (shape[2], shape[3]),
            3 => (shape[1], shape[2]),
            other => bail!("unexpected melspec output rank {other} ({shape:?})"),
        };
        if bins != MEL_BINS {
            bail!("melspec produced {bins} bins, expected {MEL_BINS}");
        }

        let flat: Vec<f32> = output.iter().copied().collect();
        for frame_idx in 0..frames {
            let mut mel_frame = [0.0f32; MEL_BINS];
            for (bin, value) in mel_frame.iter_mut().enumerate() {
                *value = flat[frame_idx * MEL_BINS + bin] / 10.0 + 2.0;
            }
            self.mel_ring.push_back(mel_frame);
        }
        self.mel_ring.trim_to(MEL_RING_CAPACITY);

        Ok(frames)
    }

    pub fn mel_len(&self) -> usize {
        self.mel_ring.len()
    }

    /// Window of `window` mel frames ending `end_offset` frames before the
    /// current tail. `None` when the ring cannot supply a full window there.
    pub fn mel_window(&self, end_offset: usize, window: usize) -> Option<Array2<f32>> {
        let len = self.mel_ring.len();
        let end = len.checked_sub(end_offset)?;
        let start = end.checked_sub(window)?;

        let mut data = Vec::with_capacity(window * MEL_BINS);
        for i in start..end {
            data.extend_from_slice(self.mel_ring.get(i)?);
        }
        Array2::from_shape_vec((window, MEL_BINS), data).ok()
    }

    pub fn reset(&mut self) {
        self.raw_ring.clear();
        self.mel_ring.clear();
        for _ in 0..PRIMING_FRAMES {
            self.mel_ring.push_back([PRIMING_VALUE; MEL_BINS]);
        }
    }
}
