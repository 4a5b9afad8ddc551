//! Benchmarks for the translation tables, the transition graph, and a full
//! reconcile pass against the in-memory store

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use unified_replication_operator::controlplane::discovery::DiscoverySnapshot;
use unified_replication_operator::controlplane::select_backend;
use unified_replication_operator::replication::state_machine;
use unified_replication_operator::{
    Backend, InMemoryResourceStore, Operation, OperatorConfig, Orchestrator, ReplicationMode,
    ReplicationState, TranslationEngine, UnifiedVolumeReplication, UnifiedVolumeReplicationSpec,
};

fn intent(name: &str, storage_class: &str) -> UnifiedVolumeReplication {
    let spec: UnifiedVolumeReplicationSpec = serde_json::from_value(serde_json::json!({
        "replicationState": "source",
        "volumeMapping": {
            "source": {"name": "data"},
            "destination": {"volumeHandle": "dr:data"}
        },
        "sourceEndpoint": {"cluster": "east", "storageClass": storage_class},
        "destinationEndpoint": {"cluster": "west", "storageClass": storage_class}
    }))
    .expect("valid spec");
    let mut uvr = UnifiedVolumeReplication::new(name, spec);
    uvr.metadata.namespace = Some("bench".into());
    uvr
}

fn bench_translation(c: &mut Criterion) {
    let mut group = c.benchmark_group("translation");
    let engine = TranslationEngine::new();
    group.throughput(Throughput::Elements(
        (ReplicationState::ALL.len() * Backend::PREFERENCE_ORDER.len()) as u64,
    ));

    group.bench_function("forward_and_reverse", |b| {
        b.iter(|| {
            for backend in Backend::PREFERENCE_ORDER {
                for state in ReplicationState::ALL {
                    let native = engine.state_to_backend(black_box(state), backend);
                    black_box(engine.from_backend(native));
                }
            }
        });
    });

    group.bench_function("parse_native", |b| {
        b.iter(|| {
            let _ = engine.from_backend_str(Backend::Trident, black_box("reestablished"));
            let _ = engine.from_backend_str(Backend::PowerStore, black_box("Failover"));
        });
    });

    let params = BTreeMap::from([
        ("mirroringMode".to_string(), "snapshot".to_string()),
        ("schedulingInterval".to_string(), "5m".to_string()),
        ("custom".to_string(), "value".to_string()),
    ]);
    group.bench_function("validate_parameters", |b| {
        b.iter(|| engine.validate_parameters(Backend::Ceph, black_box(&params)));
    });

    group.bench_function("mode_to_backend", |b| {
        b.iter(|| engine.mode_to_backend(black_box(ReplicationMode::Continuous), Backend::PowerStore));
    });

    group.finish();
}

fn bench_state_machine(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_machine");
    group.throughput(Throughput::Elements(
        (ReplicationState::ALL.len() * ReplicationState::ALL.len()) as u64,
    ));

    group.bench_function("evaluate_all_pairs", |b| {
        b.iter(|| {
            for from in ReplicationState::ALL {
                for to in ReplicationState::ALL {
                    black_box(state_machine::evaluate(black_box(from), black_box(to)));
                }
            }
        });
    });

    group.finish();
}

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");
    group.throughput(Throughput::Elements(1));

    let uvr = intent("db", "standard");
    let classes = BTreeMap::new();
    let snapshot = DiscoverySnapshot::default();

    group.bench_function("select_backend_heuristic_miss", |b| {
        b.iter(|| select_backend(black_box(&uvr.spec.routing()), &classes, &snapshot));
    });

    group.finish();
}

fn bench_reconcile_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("orchestrator");
    group.throughput(Throughput::Elements(100));

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let store = Arc::new(InMemoryResourceStore::with_backends(&Backend::PREFERENCE_ORDER));
    let orchestrator = Orchestrator::from_config(&OperatorConfig::default(), store).expect("orchestrator");
    let intents: Vec<_> = (0..100)
        .map(|i| intent(&format!("vol-{:03}", i), if i % 2 == 0 { "rbd" } else { "ontap" }))
        .collect();
    let cancel = CancellationToken::new();

    group.bench_function("reconcile_100_intents", |b| {
        b.iter(|| {
            rt.block_on(async {
                for uvr in &intents {
                    let _ = orchestrator
                        .process_replication(&cancel, uvr, Operation::Create)
                        .await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_translation,
    bench_state_machine,
    bench_selection,
    bench_reconcile_pass,
);
criterion_main!(benches);
