use criterion::{criterion_group, criterion_main, Criterion};

use wysat::config::VadMode;
use wysat::detector::{PipelineConfig, WakeWordPipeline};
use wysat::models::{ModelLoader, ModelReference};
use wysat::vad::VoiceGate;
use wysat::CHUNK_SIZE;

fn benchmark_offer(c: &mut Criterion) {
    let loader = ModelLoader::new("models", "user_models");
    let sessions = loader.load(&ModelReference::default()).unwrap();
    let mut pipeline = WakeWordPipeline::new(sessions, PipelineConfig::default()).unwrap();

    // 80ms of silence (1280 samples at 16kHz)
    let audio: Vec<i16> = vec![0i16; CHUNK_SIZE];

    c.bench_function("offer_80ms_chunk", |b| {
        b.iter(|| pipeline.offer(&audio).unwrap())
    });
}

fn benchmark_frame_gate(c: &mut Criterion) {
    let mut gate = VoiceGate::new(VadMode::Frame, 0.01);
    let audio: Vec<i16> = (0..CHUNK_SIZE as i32)
        .map(|i| ((i % 128) * 200 - 12800) as i16)
        .collect();

    c.bench_function("frame_gate_80ms_chunk", |b| b.iter(|| gate.is_speech(&audio)));
}

criterion_group!(benches, benchmark_offer, benchmark_frame_gate);
criterion_main!(benches);
