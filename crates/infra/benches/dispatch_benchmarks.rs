use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use herald_core::{NotificationRecord, Priority, Recipient, Submission, fingerprint};
use herald_infra::scheduler::select_next;
use serde_json::json;

fn submission(tenant: usize, i: usize) -> Submission {
    Submission {
        tenant_id: format!("tenant-{tenant}"),
        event_type: "otp.requested".to_string(),
        priority: match i % 3 {
            0 => Priority::P0,
            1 => Priority::P1,
            _ => Priority::P2,
        },
        to: Recipient {
            email: format!("user{i}@example.com"),
            name: Some("Bench User".to_string()),
        },
        template_id: "tpl-otp".to_string(),
        variables: json!({
            "code": format!("{i:06}"),
            "locale": "en",
            "meta": {"ip": "10.0.0.1", "agent": "bench", "tags": ["a", "b", "c"]},
        }),
        idempotency_key: format!("key-{i}"),
        ttl_seconds: Some(600),
    }
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    group.throughput(Throughput::Elements(1));

    let small = submission(0, 1);
    group.bench_function("small_variables", |b| {
        b.iter(|| fingerprint(black_box(&small)))
    });

    let mut large = submission(0, 2);
    let fields: serde_json::Map<String, serde_json::Value> = (0..200)
        .map(|k| (format!("field_{k:03}"), json!({"v": k, "nested": {"z": k, "a": [k, k + 1]}})))
        .collect();
    large.variables = serde_json::Value::Object(fields);
    group.bench_function("two_hundred_nested_fields", |b| {
        b.iter(|| fingerprint(black_box(&large)))
    });

    group.finish();
}

fn bench_claim_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_next");
    let now = Utc::now();

    for pool_size in [100usize, 1_000, 10_000] {
        let records: Vec<NotificationRecord> = (0..pool_size)
            .map(|i| {
                let s = submission(i % 50, i);
                let created = now - Duration::seconds((pool_size - i) as i64);
                NotificationRecord::accepted(&s, fingerprint(&s), created)
            })
            .collect();

        group.throughput(Throughput::Elements(pool_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(pool_size),
            &records,
            |b, records| b.iter(|| select_next(black_box(records.iter()), now).map(|r| r.id)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_claim_selection);
criterion_main!(benches);
