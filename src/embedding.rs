use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::Tensor;

use crate::ring::Ring;
use crate::{EMBEDDING_DIM, FEATURE_RING_CAPACITY, MEL_BINS};

/// Stage B of the pipeline: the embedding model and the feature ring the
/// classifier windows over.
pub struct EmbeddingExtractor {
    model: Session,
    feature_ring: Ring<[f32; EMBEDDING_DIM]>,
}

impl EmbeddingExtractor {
    pub fn new(model: Session) -> Self {
        Self {
            model,
            feature_ring: Ring::new(FEATURE_RING_CAPACITY),
        }
    }

    /// Run the model over one full mel window `[window, 32]` and append the
    /// resulting embedding to the feature ring.
    pub fn extract_window(&mut self, mel_window: &Array2<f32>) -> Result<()> {
        let (frames, bins) = mel_window.dim();
        if bins != MEL_BINS {
            bail!("mel window has {bins} bins, expected {MEL_BINS}");
        }

        let (data, _offset) = mel_window.clone().into_raw_vec_and_offset();
        let input = Array4::from_shape_vec((1, frames, MEL_BINS, 1), data)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self.model.run(ort::inputs![tensor])?;
        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .context("failed to extract embedding output")?;

        // Output is [1, 1, 1, 96]; flatten and check the element count
        // rather than trusting any particular interior rank.
        if output.len() != EMBEDDING_DIM {
            bail!(
                "embedding output has {} elements, expected {EMBEDDING_DIM}",
                output.len()
            );
        }

        let mut embedding = [0.0f32; EMBEDDING_DIM];
        for (dst, src) in embedding.iter_mut().zip(output.iter()) {
            *dst = *src;
        }
        self.feature_ring.push_back(embedding);
        self.feature_ring.trim_to(FEATURE_RING_CAPACITY);

        Ok(())
    }

    /// Batch extraction over a long mel sequence, one window every `step`
    /// frames. Used to seed the feature ring from priming noise.
    pub fn extract_batch(&mut self, mel_frames: &Array2<f32>, window: usize, step: usize) -> Result<usize> {
        let n_frames = mel_frames.shape()[0];
        if n_frames < window {
            return Ok(0);
        }

        let mut extracted = 0;
        let mut start = 0;
        while start + window <= n_frames {
            let slice = mel_frames
                .slice(ndarray::s![start..start + window, ..])
                .to_owned();
            self.extract_window(&slice)?;
            extracted += 1;
            start += step;
        }

        Ok(extracted)
    }

    /// Last `n` embeddings as `[n, 96]`, oldest first.
    pub fn features(&self, n: usize) -> Option<Array2<f32>> {
        if self.feature_ring.len() < n {
            return None;
        }

        let tail = self.feature_ring.snapshot_tail(n);
        let mut data = Vec::with_capacity(n * EMBEDDING_DIM);
        for embedding in &tail {
            data.extend_from_slice(embedding);
        }
        Array2::from_shape_vec((n, EMBEDDING_DIM), data).ok()
    }

    pub fn len(&self) -> usize {
        self.feature_ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feature_ring.is_empty()
    }

    pub fn reset(&mut self) {
        self.feature_ring.clear();
    }
}
