use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wysat::config::{SatelliteConfig, VadMode};
use wysat::models::ModelReference;
use wysat::supervisor::{Supervisor, UiEvent};

#[derive(Parser)]
#[command(name = "wysat")]
#[command(about = "Wyoming voice satellite with on-device wake word detection")]
struct Args {
    /// Classifier model (builtin:<name>.onnx or user:<name>.onnx)
    #[arg(short, long, default_value = "builtin:hey_nabu.onnx")]
    model: ModelReference,

    /// Directory holding the bundled ONNX graphs
    #[arg(long, default_value = "models")]
    model_dir: PathBuf,

    /// Directory holding user-imported classifiers
    #[arg(long, default_value = "user_models")]
    user_model_dir: PathBuf,

    /// TCP port to listen on
    #[arg(short, long, default_value = "10700")]
    port: u16,

    /// Detection threshold (0.0 - 1.0)
    #[arg(short, long, default_value = "0.05")]
    threshold: f32,

    /// Cooldown after a detection, in milliseconds
    #[arg(long, default_value = "60000")]
    streaming_timeout_ms: u64,

    /// Voice gate: energy or frame
    #[arg(long, default_value = "frame")]
    vad_mode: String,

    /// RMS threshold below which audio counts as silence
    #[arg(long, default_value = "0.01")]
    rms_silence_threshold: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let vad_mode = match args.vad_mode.as_str() {
        "energy" => VadMode::Energy,
        _ => VadMode::Frame,
    };

    let config = SatelliteConfig {
        selected_model: args.model,
        server_port: args.port,
        threshold: args.threshold,
        streaming_timeout_ms: args.streaming_timeout_ms,
        rms_silence_threshold: args.rms_silence_threshold,
        vad_mode,
        builtin_model_dir: args.model_dir,
        user_model_dir: args.user_model_dir,
        ..SatelliteConfig::default()
    };

    let supervisor = Supervisor::start(config)?;
    let events = supervisor.subscribe();

    // Runs until killed; lifecycle events go to the log.
    while let Ok(event) = events.recv() {
        match event {
            UiEvent::ListeningStarted => info!("listening"),
            UiEvent::ListeningStopped => info!("idle"),
            UiEvent::Started => info!("running"),
            UiEvent::Stopped => break,
        }
    }

    supervisor.shutdown()
}
