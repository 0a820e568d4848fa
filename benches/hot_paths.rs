use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use aggregoor::profile::{MeasurementRecord, ProfileKey, Rollup, StampedRecord};
use aggregoor::store::{Codec, JsonCodec};

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn tags() -> Vec<(String, String)> {
    // Unsorted, with a duplicate, so key construction has real
    // normalization work to do.
    vec![
        ("region".to_string(), "eu-west-1".to_string()),
        ("tier".to_string(), "gold".to_string()),
        ("service".to_string(), "checkout".to_string()),
        ("zone".to_string(), "b".to_string()),
        ("release".to_string(), "2026.08".to_string()),
        ("region".to_string(), "eu-west-1".to_string()),
    ]
}

fn sample_record() -> MeasurementRecord {
    let mut values = BTreeMap::new();
    for (name, value) in [
        ("latency_ms", 123.4),
        ("bytes_in", 2_048.0),
        ("bytes_out", 512.0),
        ("db_time_ms", 41.7),
        ("cache_hits", 12.0),
        ("cache_misses", 3.0),
        ("queue_wait_ms", 5.5),
        ("retries", 1.0),
    ] {
        values.insert(name.to_string(), value);
    }

    MeasurementRecord {
        tenant_id: "acme".to_string(),
        dataset_id: "checkout".to_string(),
        tags: tags(),
        timestamp: ts("2026-03-14T10:17:42Z"),
        values,
    }
}

fn sample_stamped() -> StampedRecord {
    StampedRecord {
        record: sample_record(),
        session_start: ts("2026-03-14T09:58:00Z"),
        window_start: ts("2026-03-14T10:00:00Z"),
    }
}

fn bench_profile_key(c: &mut Criterion) {
    let session = ts("2026-03-14T09:58:00Z");
    let window = ts("2026-03-14T10:00:00Z");
    let raw_tags = tags();

    c.bench_function("profile_key/normalize_tags", |b| {
        b.iter(|| {
            ProfileKey::new(
                black_box("acme"),
                black_box("checkout"),
                black_box(raw_tags.clone()),
                session,
                window,
            )
        })
    });

    let stamped = sample_stamped();
    c.bench_function("profile_key/from_stamped_record", |b| {
        b.iter(|| black_box(&stamped).profile_key())
    });
}

fn bench_rollup(c: &mut Criterion) {
    let record = sample_record();

    c.bench_function("rollup/track_record", |b| {
        let mut rollup = Rollup::default();
        b.iter(|| rollup.track(black_box(&record)))
    });
}

fn bench_codec(c: &mut Criterion) {
    let codec = JsonCodec;
    let stamped = sample_stamped();
    let bytes = codec.encode(&stamped).expect("encode stamped record");

    c.bench_function("codec/encode_stamped_record", |b| {
        b.iter(|| codec.encode(black_box(&stamped)).expect("encode"))
    });

    c.bench_function("codec/decode_stamped_record", |b| {
        b.iter(|| {
            let decoded: StampedRecord = codec.decode(black_box(&bytes)).expect("decode");
            decoded
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_profile_key(c);
    bench_rollup(c);
    bench_codec(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
