//! Benchmark tests for kino-playback operations
//!
//! Run with: cargo bench -p kino-playback

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use kino_playback::provider::simulated::{SimulatedFactory, SimulationProfile};
use kino_playback::types::*;
use kino_playback::{
    Capability, CapabilitySet, EventBus, MediaModel, ModelChange, PlayerEvent,
    PlaylistItem, ProviderDescriptor, ProviderKind, ProviderRegistry,
};

// ============================================================================
// Helpers
// ============================================================================

fn registry_with(count: usize) -> ProviderRegistry {
    let registry = ProviderRegistry::new();
    let factory = Arc::new(SimulatedFactory::new("sim", SimulationProfile::default()));
    for i in 0..count {
        // only the last registered backend can play HLS
        let capabilities = if i + 1 == count {
            CapabilitySet::new().with(Capability::Hls)
        } else {
            CapabilitySet::new().with(Capability::WebM)
        };
        registry.register_static(
            ProviderDescriptor::new(format!("backend-{}", i), ProviderKind::Html5)
                .with_capabilities(capabilities)
                .with_priority(i as u32),
            factory.clone(),
        );
    }
    registry
}

fn hls_item() -> PlaylistItem {
    PlaylistItem::from_url("https://cdn.example.com/stream/master.m3u8").unwrap()
}

// ============================================================================
// Registry Benchmarks
// ============================================================================

fn bench_registry_choose(c: &mut Criterion) {
    let mut group = c.benchmark_group("Registry Choose");
    let item = hls_item();

    for count in [3usize, 10, 50] {
        let registry = registry_with(count);
        group.bench_with_input(BenchmarkId::new("providers", count), &count, |b, _| {
            b.iter(|| registry.choose(black_box(&item)))
        });
    }

    group.finish();
}

fn bench_item_requirements(c: &mut Criterion) {
    let items = [
        PlaylistItem::from_url("https://cdn.example.com/clip.mp4").unwrap(),
        hls_item(),
        PlaylistItem::from_url("https://cdn.example.com/dash/manifest.mpd").unwrap(),
    ];

    c.bench_function("item_requirements", |b| {
        b.iter(|| {
            for item in &items {
                black_box(item.requirements());
            }
        })
    });
}

// ============================================================================
// Model Benchmarks
// ============================================================================

fn bench_media_model(c: &mut Criterion) {
    let mut group = c.benchmark_group("Media Model");

    group.bench_function("state_cycle", |b| {
        b.iter(|| {
            let mut model = MediaModel::new();
            model.set_state(MediaState::Loading);
            model.set_state(MediaState::Loaded);
            model.set_state(MediaState::Playing);
            model.set_state(MediaState::Paused);
            model.set_state(MediaState::Playing);
            black_box(model.set_state(MediaState::Complete))
        })
    });

    group.bench_function("position_updates", |b| {
        let mut model = MediaModel::new();
        model.set_duration(3600.0, 120.0);
        b.iter(|| {
            for i in 0..1000 {
                model.set_position(black_box(i as f64 * 0.25));
            }
        })
    });

    group.bench_function("clamp_seek", |b| {
        let mut model = MediaModel::new();
        model.set_duration(120.0, 120.0);
        b.iter(|| model.clamp_seek(black_box(150.0)))
    });

    group.finish();
}

fn bench_clamping(c: &mut Criterion) {
    c.bench_function("clamp_volume_and_rate", |b| {
        b.iter(|| {
            black_box(clamp_volume(black_box(150)));
            black_box(clamp_playback_rate(black_box(8.0), StreamType::Vod));
        })
    });
}

// ============================================================================
// Event Benchmarks
// ============================================================================

fn bench_event_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("Event Publish");

    for subscribers in [0usize, 1, 4] {
        let bus = EventBus::new(1024);
        let mut receivers: Vec<_> = (0..subscribers).map(|_| bus.subscribe()).collect();
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    bus.publish(ModelChange::Position(black_box(12.5)));
                    for rx in receivers.iter_mut() {
                        let _ = rx.try_recv();
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_event_serialization(c: &mut Criterion) {
    let event = PlayerEvent::Time {
        position: 42.0,
        duration: 120.0,
    };
    c.bench_function("event_to_json", |b| {
        b.iter(|| serde_json::to_string(black_box(&event)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_registry_choose,
    bench_item_requirements,
    bench_media_model,
    bench_clamping,
    bench_event_publish,
    bench_event_serialization,
);
criterion_main!(benches);
