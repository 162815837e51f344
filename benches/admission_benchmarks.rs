use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{header, HeaderMap, HeaderValue, Method};
use s3gate::clock::SystemClock;
use s3gate::counters::{Dimension, RateCounters};
use s3gate::credentials::CredentialExtractor;
use s3gate::engine::{AdmissionEngine, RequestDescriptor};
use s3gate::tiers::{parse_identity_map, LimitsFile, TierStore};
use std::sync::Arc;
use std::time::Instant;

const LIMITS: &str = r#"
requests_per_minute: { premium: 1000000000, default: 1000000000 }
requests_per_second: { premium: 1000000000, default: 1000000000 }
bytes_in_per_minute: { default: 1000000000000 }
bytes_out_per_minute: { default: 1000000000000 }
"#;

fn engine(identities: usize) -> AdmissionEngine {
    let mapping: String = (0..identities)
        .map(|i| format!("AKIA{:08} premium\n", i))
        .collect();

    let store = Arc::new(TierStore::in_memory(None));
    store.publish(
        parse_identity_map(&mapping, "bench").unwrap(),
        LimitsFile::from_yaml(LIMITS).unwrap(),
    );

    AdmissionEngine::new(
        CredentialExtractor::default(),
        store,
        Arc::new(RateCounters::default()),
        Arc::new(SystemClock),
    )
}

fn sigv4(identity: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let value = format!(
        "AWS4-HMAC-SHA256 Credential={}/20240101/us-east-1/s3/aws4_request, SignedHeaders=host, Signature=abc",
        identity
    );
    headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
    headers
}

fn benchmark_credential_extraction(c: &mut Criterion) {
    let extractor = CredentialExtractor::default();
    let headers = sigv4("AKIA00000001");
    let query = "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential=AKIAPRESIGN%2F20240101%2Fus-east-1%2Fs3%2Faws4_request";

    c.bench_function("extract_sigv4_header", |b| {
        b.iter(|| extractor.extract(black_box(&headers), None))
    });

    c.bench_function("extract_presigned_v4_query", |b| {
        b.iter(|| extractor.extract(black_box(&HeaderMap::new()), black_box(Some(query))))
    });
}

fn benchmark_counter_observe(c: &mut Criterion) {
    let counters = RateCounters::default();
    let now = Instant::now();

    c.bench_function("counter_observe_hot_key", |b| {
        b.iter(|| counters.observe(black_box("AKIA00000001"), Dimension::ReqPerMinute, 1, now))
    });
}

fn benchmark_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");

    for identities in [10usize, 1_000, 100_000] {
        let engine = engine(identities);
        let headers = sigv4("AKIA00000007");

        group.bench_with_input(BenchmarkId::from_parameter(identities), &identities, |b, _| {
            b.iter(|| {
                engine.evaluate(black_box(&RequestDescriptor {
                    method: &Method::GET,
                    path: "/bucket/key",
                    headers: &headers,
                    query: None,
                    request_id: "bench",
                    bytes: 0,
                }))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_credential_extraction,
    benchmark_counter_observe,
    benchmark_evaluate
);
criterion_main!(benches);
