pub mod audio;
pub mod config;
pub mod detector;
pub mod embedding;
pub mod models;
pub mod preprocessing;
pub mod protocol;
pub mod ring;
pub mod satellite;
pub mod server;
pub mod supervisor;
pub mod vad;

// Critical constants - must match the openWakeWord model family exactly
pub const SAMPLE_RATE: u32 = 16000;
pub const CHUNK_SIZE: usize = 1280; // 80ms at 16kHz
pub const MEL_BINS: usize = 32;
pub const EMBEDDING_WINDOW: usize = 76; // mel frames per embedding input
pub const EMBEDDING_STEP: usize = 8; // mel frames between embedding windows
pub const EMBEDDING_DIM: usize = 96;
pub const CLASSIFICATION_FRAMES: usize = 16;

// Ring sizing
pub const RAW_RING_CAPACITY: usize = 160_000; // 10s at 16kHz
pub const MEL_RING_CAPACITY: usize = 970;
pub const FEATURE_RING_CAPACITY: usize = 120;

// Mel stage intake
pub const MEL_LOOKBACK_SAMPLES: usize = 480; // analysis-window overlap
pub const MEL_MIN_SAMPLES: usize = 400; // below this the mel model cannot run

pub use config::SatelliteConfig;
pub use detector::WakeWordPipeline;
pub use satellite::{Satellite, SatelliteState};
pub use supervisor::Supervisor;
