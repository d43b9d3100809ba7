use criterion::{Criterion, black_box, criterion_group, criterion_main};
use kindb::catalog::MemorySchema;
use kindb::catalog::schema::{Cardinality, ClassDef, PropertyDescriptor};
use kindb::catalog::types::Kind;
use kindb::config::KindbConfig;
use kindb::permission::Principal;
use kindb::query::{AnalyticsProps, MetaProperty, MetaQuery, StatisticalAnalysis, analytics_hash};
use kindb::storage::MemoryConnector;
use kindb::{Collaborators, KindbInstance, ObjectCreate, ObjectUpdate};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

fn open_db() -> KindbInstance {
    let schema = MemorySchema::new()
        .with_class(
            ClassDef::new(Kind::Thing, "City")
                .with_property(PropertyDescriptor::primitive("name", "string"))
                .with_property(PropertyDescriptor::primitive("population", "int"))
                .with_property(PropertyDescriptor::reference(
                    "sisters",
                    &["City"],
                    Cardinality::Many,
                )),
        )
        .expect("schema");
    let collaborators = Collaborators::new(Arc::new(MemoryConnector::new()), Arc::new(schema));
    KindbInstance::open(KindbConfig::development(), collaborators).expect("open")
}

fn meta_query() -> MetaQuery {
    MetaQuery {
        kind: Kind::Thing,
        class_name: "City".into(),
        filters: None,
        include_meta_count: true,
        properties: vec![
            MetaProperty::new(
                "population",
                vec![
                    StatisticalAnalysis::Count,
                    StatisticalAnalysis::Mean,
                    StatisticalAnalysis::Maximum,
                ],
            ),
            MetaProperty::new("name", vec![StatisticalAnalysis::TopOccurrences]),
        ],
        analytics: AnalyticsProps {
            use_analytics_engine: true,
            force_recalculate: false,
        },
    }
}

fn bench_fingerprint(c: &mut Criterion) {
    let query = meta_query();
    c.bench_function("analytics_hash", |b| {
        b.iter(|| black_box(analytics_hash(black_box(&query)).expect("hash")))
    });
}

fn bench_mutations(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let db = &open_db();
    let principal = &Principal::new(Uuid::new_v4());

    c.bench_function("create_sync", |b| {
        b.to_async(&rt).iter(|| async move {
            let mut outcome = db
                .create(
                    principal,
                    Kind::Thing,
                    ObjectCreate {
                        class: "City".into(),
                        context: String::new(),
                        schema: json!({"name": "bench", "population": 1}),
                        async_write: false,
                    },
                )
                .await
                .expect("create");
            black_box(outcome.settle().await);
        })
    });

    let id = rt.block_on(async {
        db.create(
            principal,
            Kind::Thing,
            ObjectCreate {
                class: "City".into(),
                context: String::new(),
                schema: json!({"name": "target"}),
                async_write: false,
            },
        )
        .await
        .expect("create")
        .id()
        .expect("id")
    });
    c.bench_function("update_settled", |b| {
        b.to_async(&rt).iter(|| async move {
            let mut outcome = db
                .update(
                    principal,
                    Kind::Thing,
                    id,
                    ObjectUpdate {
                        class: "City".into(),
                        context: String::new(),
                        schema: json!({"name": "target", "population": 2}),
                    },
                )
                .await
                .expect("update");
            black_box(outcome.settle().await);
        })
    });
}

criterion_group!(benches, bench_fingerprint, bench_mutations);
criterion_main!(benches);
