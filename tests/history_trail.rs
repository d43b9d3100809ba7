use kindb::catalog::MemorySchema;
use kindb::catalog::schema::{ClassDef, PropertyDescriptor};
use kindb::catalog::types::{Kind, PropertyValue, Scalar};
use kindb::config::KindbConfig;
use kindb::error::MutationStatus;
use kindb::history::HistoryKind;
use kindb::permission::{OwnerOnly, Principal};
use kindb::storage::MemoryConnector;
use kindb::storage::memory::ConnectorOp;
use kindb::tasks::TaskOutcome;
use kindb::{Collaborators, KindbInstance, ObjectCreate, ObjectUpdate};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn open() -> (KindbInstance, Arc<MemoryConnector>) {
    let schema = MemorySchema::new()
        .with_class(
            ClassDef::new(Kind::Action, "Visit")
                .with_property(PropertyDescriptor::primitive("note", "text"))
                .with_property(PropertyDescriptor::primitive("nights", "int")),
        )
        .expect("schema");
    let connector = Arc::new(MemoryConnector::new());
    let collaborators = Collaborators::new(connector.clone(), Arc::new(schema))
        .with_authorizer(Arc::new(OwnerOnly));
    let db = KindbInstance::open(KindbConfig::development(), collaborators).expect("open");
    (db, connector)
}

fn text(value: &str) -> PropertyValue {
    PropertyValue::Primitive(Scalar::Text(value.into()))
}

#[tokio::test]
async fn update_then_delete_keeps_full_trail() {
    let (db, connector) = open();
    let owner = Principal::new(Uuid::new_v4());
    let mut created = db
        .create(
            &owner,
            Kind::Action,
            ObjectCreate {
                class: "Visit".into(),
                context: "trip".into(),
                schema: json!({"note": "first", "nights": 2}),
                async_write: false,
            },
        )
        .await
        .expect("create");
    created.settle().await;
    let id = created.id().expect("id");

    let mut updated = db
        .update(
            &owner,
            Kind::Action,
            id,
            ObjectUpdate {
                class: "Visit".into(),
                context: "trip".into(),
                schema: json!({"note": "second", "nights": 3}),
            },
        )
        .await
        .expect("update");
    updated.settle().await;

    let mut deleted = db.delete(&owner, Kind::Action, id).await.expect("delete");
    assert_eq!(deleted.status, MutationStatus::Accepted);
    for (label, result) in deleted.settle().await {
        assert_eq!(result, TaskOutcome::Completed, "{label}");
    }

    let history = db.history(&owner, Kind::Action, id).await.expect("history");
    assert!(history.deleted);
    assert!(history.live.is_none());
    let kinds: Vec<HistoryKind> = history.entries.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![HistoryKind::Update, HistoryKind::Delete]);
    assert_eq!(history.entries[0].object.schema.get("note"), Some(&text("first")));
    assert_eq!(history.entries[1].object.schema.get("note"), Some(&text("second")));
    assert!(history.entries[0].archived_at_unix <= history.entries[1].archived_at_unix);
    assert_eq!(connector.archive_count(), 2);
    assert_eq!(connector.delete_count(), 1);

    // The trail is still owned by the deleted object's key.
    let stranger = Principal::new(Uuid::new_v4());
    let err = db
        .history(&stranger, Kind::Action, id)
        .await
        .expect_err("stranger");
    assert_eq!(err.status(), MutationStatus::Forbidden);
}

#[tokio::test]
async fn failed_archive_does_not_block_the_write() {
    let (db, connector) = open();
    let owner = Principal::new(Uuid::new_v4());
    let id = db
        .create(
            &owner,
            Kind::Action,
            ObjectCreate {
                class: "Visit".into(),
                context: String::new(),
                schema: json!({"note": "before"}),
                async_write: false,
            },
        )
        .await
        .expect("create")
        .id()
        .expect("id");

    connector.fail_on(ConnectorOp::Archive);
    let mut updated = db
        .update(
            &owner,
            Kind::Action,
            id,
            ObjectUpdate {
                class: "Visit".into(),
                context: String::new(),
                schema: json!({"note": "after"}),
            },
        )
        .await
        .expect("update");
    let results = updated.settle().await;
    assert!(
        results
            .iter()
            .any(|(label, r)| *label == "archive_prior_state" && matches!(r, TaskOutcome::Failed(_)))
    );
    connector.clear_failures();

    let live = db.get(&owner, Kind::Action, id).await.expect("get");
    assert_eq!(live.object.schema.get("note"), Some(&text("after")));
    let history = db.history(&owner, Kind::Action, id).await.expect("history");
    assert!(history.entries.is_empty());
    assert_eq!(db.lock_metrics().held(), 0);
    assert_eq!(db.task_metrics().failed, 1);
}
