//! Hot-path benchmarks: fingerprint lookup and traffic recording
//!
//! Run with: cargo bench

use anytls_node::panel::{
    CredentialDirectory, DirectorySnapshot, DirectorySource, PanelUser, ReportingSink,
    TrafficAccountant, TrafficRecord,
};
use anytls_node::util::fingerprint;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures::future::BoxFuture;
use std::hint::black_box;
use std::sync::Arc;

struct FixedSource(Vec<PanelUser>);

impl DirectorySource for FixedSource {
    fn fetch_users(&self) -> BoxFuture<'_, anytls_node::Result<Vec<PanelUser>>> {
        let users = self.0.clone();
        Box::pin(async move { Ok(users) })
    }
}

struct DiscardSink;

impl ReportingSink for DiscardSink {
    fn submit(&self, _records: Vec<TrafficRecord>) -> BoxFuture<'_, anytls_node::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn users(count: u64) -> Vec<PanelUser> {
    (1..=count)
        .map(|id| PanelUser {
            id,
            uuid: format!("00000000-0000-4000-8000-{:012}", id),
            speed_limit: None,
        })
        .collect()
}

fn bench_snapshot_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_build");
    for count in [100u64, 1_000, 10_000] {
        let list = users(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &list, |b, list| {
            b.iter(|| black_box(DirectorySnapshot::build(list)));
        });
    }
    group.finish();
}

fn bench_fingerprint_lookup(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let list = users(10_000);
    let hit = fingerprint(&list[5_000].uuid);
    let miss = fingerprint("not-a-user");
    let directory = CredentialDirectory::new(Arc::new(FixedSource(list)));
    runtime.block_on(directory.refresh()).unwrap();

    c.bench_function("lookup_hit", |b| {
        b.iter(|| black_box(directory.lookup_by_fingerprint(black_box(&hit))));
    });
    c.bench_function("lookup_miss", |b| {
        b.iter(|| black_box(directory.lookup_by_fingerprint(black_box(&miss))));
    });
}

fn bench_record(c: &mut Criterion) {
    let accountant = TrafficAccountant::new(Arc::new(DiscardSink));
    accountant.record(1, 1, 1);

    c.bench_function("record_existing_user", |b| {
        b.iter(|| accountant.record(black_box(1), 1500, 3000));
    });

    let mut next_user = 1_000u64;
    c.bench_function("record_new_user", |b| {
        b.iter(|| {
            next_user += 1;
            accountant.record(black_box(next_user), 1500, 3000);
        });
    });
}

fn bench_flush(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let accountant = Arc::new(TrafficAccountant::new(Arc::new(DiscardSink)));

    c.bench_function("flush_1000_users", |b| {
        b.to_async(&runtime).iter(|| {
            let accountant = Arc::clone(&accountant);
            async move {
                for user_id in 1..=1_000u64 {
                    accountant.record(user_id, 100, 200);
                }
                black_box(accountant.flush().await.unwrap())
            }
        });
    });
}

criterion_group!(
    benches,
    bench_snapshot_build,
    bench_fingerprint_lookup,
    bench_record,
    bench_flush
);
criterion_main!(benches);
