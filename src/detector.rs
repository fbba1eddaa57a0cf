use anyhow::{Context, Result};
use ndarray::Array3;
use ort::session::Session;
use ort::value::Tensor;
use rand::Rng;

use crate::embedding::EmbeddingExtractor;
use crate::models::ModelSessions;
use crate::preprocessing::Preprocessor;
use crate::{CHUNK_SIZE, CLASSIFICATION_FRAMES, EMBEDDING_STEP, EMBEDDING_WINDOW, SAMPLE_RATE};

/// Windowing parameters of the streaming pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Detection threshold. The pipeline itself only reports raw scores;
    /// the state machine compares against this.
    pub threshold: f32,
    /// Samples per pipeline tick.
    pub hop_samples: usize,
    /// Mel frames per embedding window.
    pub mel_window: usize,
    /// Mel frames between successive embedding windows.
    pub mel_stride: usize,
    /// Embeddings per classifier call.
    pub feature_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            hop_samples: CHUNK_SIZE,
            mel_window: EMBEDDING_WINDOW,
            mel_stride: EMBEDDING_STEP,
            feature_window: CLASSIFICATION_FRAMES,
        }
    }
}

/// Streaming three-stage wake-word scorer.
///
/// `offer` consumes captured chunks and produces one score per whole hop of
/// accumulated audio. Model sessions live as long as the pipeline and are
/// released when it drops.
pub struct WakeWordPipeline {
    preprocessor: Preprocessor,
    embeddings: EmbeddingExtractor,
    classifier: Session,
    config: PipelineConfig,
    remainder: Vec<i16>,
    last_score: Option<f32>,
}

impl WakeWordPipeline {
    pub fn new(sessions: ModelSessions, config: PipelineConfig) -> Result<Self> {
        let mut pipeline = Self {
            preprocessor: Preprocessor::new(sessions.melspec),
            embeddings: EmbeddingExtractor::new(sessions.embedding),
            classifier: sessions.classifier,
            config,
            remainder: Vec::with_capacity(CHUNK_SIZE),
            last_score: None,
        };
        pipeline.prime()?;
        Ok(pipeline)
    }

    /// Feed one captured chunk. Returns the classifier score for the audio
    /// prefix ending at the last whole hop, or `None` while there is not yet
    /// enough data. An empty chunk returns the previous score untouched.
    pub fn offer(&mut self, chunk: &[i16]) -> Result<Option<f32>> {
        if chunk.is_empty() {
            return Ok(self.last_score);
        }

        let (samples, whole_chunks) = intake(&mut self.remainder, chunk, self.config.hop_samples);
        let pushed = samples.len();
        self.preprocessor.push_samples(&samples);

        // Cold-start guard: the mel model cannot run on less than one
        // analysis window of audio.
        if !self.preprocessor.ready() {
            return Ok(None);
        }

        self.preprocessor.run(pushed)?;

        // One embedding per whole hop consumed, windows ending
        // mel_stride * i frames before the current tail, oldest first.
        for i in (0..whole_chunks).rev() {
            let end_offset = self.config.mel_stride * i;
            if let Some(window) = self
                .preprocessor
                .mel_window(end_offset, self.config.mel_window)
            {
                self.embeddings.extract_window(&window)?;
            }
        }

        let features = match self.embeddings.features(self.config.feature_window) {
            Some(features) => features,
            None => return Ok(None),
        };

        let score = self.classify(&features)?;
        self.last_score = Some(score);
        Ok(Some(score))
    }

    pub fn last_score(&self) -> Option<f32> {
        self.last_score
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Drop all buffered audio and re-seed the feature ring.
    pub fn reset(&mut self) -> Result<()> {
        self.preprocessor.reset();
        self.embeddings.reset();
        self.remainder.clear();
        self.last_score = None;
        self.prime()
    }

    /// Seed the feature ring from 4s of synthetic noise so the first real
    /// classifier call sees a full window of plausible features.
    fn prime(&mut self) -> Result<()> {
        let mut rng = rand::thread_rng();
        let samples: Vec<i16> = (0..4 * SAMPLE_RATE as usize)
            .map(|_| rng.gen_range(-999..1000))
            .collect();

        self.preprocessor.push_samples(&samples);
        self.preprocessor
            .run(samples.len())
            .context("priming mel pass failed")?;

        let mel = self
            .preprocessor
            .mel_window(0, self.preprocessor.mel_len())
            .context("priming produced no mel frames")?;
        let seeded = self
            .embeddings
            .extract_batch(&mel, self.config.mel_window, self.config.mel_stride)
            .context("priming embedding pass failed")?;

        if self.embeddings.len() < self.config.feature_window {
            anyhow::bail!(
                "priming seeded only {seeded} embeddings, need {}",
                self.config.feature_window
            );
        }
        Ok(())
    }

    fn classify(&mut self, features: &ndarray::Array2<f32>) -> Result<f32> {
        let (frames, dim) = features.dim();
        let (data, _offset) = features.clone().into_raw_vec_and_offset();
        let input = Array3::from_shape_vec((1, frames, dim), data)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self.classifier.run(ort::inputs![tensor])?;
        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .context("failed to extract classifier output")?;

        // Expected [1, 1]; tolerate an extra or a missing leading axis.
        let shape = output.shape();
        let score = if shape.len() == 3 {
            output[[0, 0, 0]]
        } else if shape.len() == 2 {
            output[[0, 0]]
        } else {
            output[[0]]
        };
        Ok(score)
    }
}

/// Combine the carried remainder with an incoming chunk and split off whole
/// hops. Returns the samples to push into the raw ring and the number of
/// whole hops they contain; the sub-hop tail becomes the new remainder.
fn intake(remainder: &mut Vec<i16>, chunk: &[i16], hop: usize) -> (Vec<i16>, usize) {
    let mut samples = std::mem::take(remainder);
    samples.extend_from_slice(chunk);

    let whole = samples.len() / hop;
    if whole > 0 {
        let keep = samples.len() % hop;
        *remainder = samples.split_off(samples.len() - keep);
    }
    (samples, whole)
}
