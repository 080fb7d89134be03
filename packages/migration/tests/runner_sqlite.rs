//! Runner tests against a SQLite file database
//!
//! Tests prove:
//! - generate writes exactly one artifact whose predecessor is the prior head
//! - an empty description writes nothing
//! - apply is idempotent once the marker is at head
//! - a failing artifact leaves the marker at the last success
//! - upgrade followed by downgrade restores the live schema
//! - a branched history is refused
//! - a locked database is reported, not read as unmigrated

use std::fs;
use std::path::Path;

use migration::introspect::{expected_tables, live_tables};
use migration::{
    apply, current_revision, downgrade, generate, status, Artifact, ArtifactState, ArtifactStore,
    Chain, ColumnDef, ColumnType, Description, IndexDef, MigrationError, ModelFile, SchemaOp,
    SchemaSnapshot, TableDef,
};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use tempfile::TempDir;

async fn connect(dir: &Path) -> DatabaseConnection {
    let mut opt = ConnectOptions::new(test_support::sqlite_file_url(dir, "app.db"));
    opt.min_connections(1).max_connections(1).sqlx_logging(false);
    Database::connect(opt).await.expect("Should connect to sqlite file")
}

fn user_model() -> SchemaSnapshot {
    SchemaSnapshot::new().with_table(
        TableDef::new("user")
            .column(
                ColumnDef::new("id", ColumnType::Integer)
                    .primary_key()
                    .auto_increment(),
            )
            .column(ColumnDef::new("email", ColumnType::Varchar(254)).not_null().unique())
            .column(ColumnDef::new("username", ColumnType::Varchar(50)).not_null())
            .index(IndexDef::new("ix_user_username", &["username"]).unique()),
    )
}

fn create_table(name: &str) -> Vec<SchemaOp> {
    vec![SchemaOp::CreateTable {
        table: TableDef::new(name).column(ColumnDef::new("id", ColumnType::Integer).primary_key()),
    }]
}

fn artifact(parent: Option<&Artifact>, description: &str, upgrade: Vec<SchemaOp>) -> Artifact {
    Artifact::next(parent, &Description::new(description).unwrap(), upgrade).unwrap()
}

fn artifact_files(store: &ArtifactStore) -> usize {
    match fs::read_dir(store.dir()) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn add_user_table_scenario() {
    test_support::logging::init();
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));
    let db = connect(dir.path()).await;

    let artifact = generate(&store, &user_model(), "add user table").expect("generate");
    assert!(artifact.down_revision.is_none());
    assert_eq!(artifact.upgrade.len(), 1);
    assert!(
        matches!(&artifact.upgrade[0], SchemaOp::CreateTable { table } if table.name == "user")
    );
    assert_eq!(artifact_files(&store), 1);

    let applied = apply(&db, &store).await.expect("apply");
    assert_eq!(applied, vec![artifact.revision.clone()]);
    assert_eq!(
        current_revision(&db).await.unwrap().as_deref(),
        Some(artifact.revision.as_str())
    );

    let live = live_tables(&db).await.unwrap();
    assert_eq!(live, expected_tables(&user_model()));
}

#[tokio::test]
async fn generate_links_to_prior_head_and_keeps_a_total_order() {
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path());

    let first = generate(&store, &user_model(), "add user table").unwrap();

    let mut model = user_model();
    model.tables.insert(
        "post".to_string(),
        TableDef::new("post").column(ColumnDef::new("id", ColumnType::BigInteger).primary_key()),
    );
    let second = generate(&store, &model, "add post table").unwrap();

    assert_eq!(second.down_revision.as_deref(), Some(first.revision.as_str()));
    assert_eq!(second.sequence, first.sequence + 1);
    assert!(matches!(&second.upgrade[..], [SchemaOp::CreateTable { table }] if table.name == "post"));

    let chain = Chain::build(store.load().unwrap()).unwrap();
    assert_eq!(chain.heads().len(), 1);
    assert_eq!(chain.ordered().unwrap().len(), 2);

    // No model change: still exactly one new (empty) artifact on top.
    let third = generate(&store, &model, "checkpoint").unwrap();
    assert!(third.is_empty());
    assert_eq!(third.down_revision.as_deref(), Some(second.revision.as_str()));
    assert_eq!(artifact_files(&store), 3);
}

#[tokio::test]
async fn empty_description_writes_nothing() {
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));

    for description in ["", "   "] {
        let err = generate(&store, &user_model(), description).unwrap_err();
        assert!(err.is_usage());
    }
    assert!(!store.dir().exists());
}

#[tokio::test]
async fn unreadable_model_is_a_generation_error() {
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));
    let model_path = dir.path().join("model.json");
    fs::write(&model_path, "{\"tables\": 42}").unwrap();

    let err = generate(&store, &ModelFile::new(&model_path), "broken").unwrap_err();
    assert!(matches!(err, MigrationError::Generation { .. }));
    assert_eq!(artifact_files(&store), 0);
}

#[tokio::test]
async fn apply_twice_is_a_noop() {
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));
    let db = connect(dir.path()).await;

    generate(&store, &user_model(), "add user table").unwrap();
    let first = apply(&db, &store).await.unwrap();
    assert_eq!(first.len(), 1);
    let marker = current_revision(&db).await.unwrap();

    let second = apply(&db, &store).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(current_revision(&db).await.unwrap(), marker);
}

#[tokio::test]
async fn failing_artifact_leaves_marker_at_last_success() {
    test_support::logging::init();
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));
    let db = connect(dir.path()).await;

    let one = artifact(None, "create alpha", create_table("alpha"));
    let two = artifact(
        Some(&one),
        "extend missing table",
        vec![SchemaOp::AddColumn {
            table: "ghost".to_string(),
            column: ColumnDef::new("note", ColumnType::Text),
        }],
    );
    let three = artifact(Some(&two), "create gamma", create_table("gamma"));
    for a in [&one, &two, &three] {
        store.write(a).unwrap();
    }

    let err = apply(&db, &store).await.unwrap_err();
    match err {
        MigrationError::Apply {
            revision,
            marker,
            applied,
            ..
        } => {
            assert_eq!(revision, two.revision);
            assert_eq!(marker.as_deref(), Some(one.revision.as_str()));
            assert_eq!(applied, vec![one.revision.clone()]);
        }
        other => panic!("expected apply error, got {other:?}"),
    }

    assert_eq!(
        current_revision(&db).await.unwrap().as_deref(),
        Some(one.revision.as_str())
    );
    let live = live_tables(&db).await.unwrap();
    assert!(live.contains_key("alpha"));
    assert!(!live.contains_key("gamma"));

    let states: Vec<ArtifactState> = status(&db, &store)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.state)
        .collect();
    assert_eq!(
        states,
        vec![ArtifactState::Applied, ArtifactState::Pending, ArtifactState::Pending]
    );
}

#[tokio::test]
async fn upgrade_then_downgrade_restores_schema() {
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));
    let db = connect(dir.path()).await;

    generate(&store, &user_model(), "add user table").unwrap();
    apply(&db, &store).await.unwrap();
    let before = live_tables(&db).await.unwrap();
    let base_marker = current_revision(&db).await.unwrap();

    let mut model = user_model();
    let user = model.tables.get_mut("user").unwrap();
    user.columns.push(ColumnDef::new("nickname", ColumnType::Text));
    user.indexes.push(IndexDef::new("ix_user_email", &["email"]));
    model.tables.insert(
        "post".to_string(),
        TableDef::new("post")
            .column(ColumnDef::new("id", ColumnType::Integer).primary_key())
            .column(ColumnDef::new("title", ColumnType::Varchar(200)).not_null()),
    );
    let change = generate(&store, &model, "add posts and nickname").unwrap();
    apply(&db, &store).await.unwrap();
    assert_eq!(live_tables(&db).await.unwrap(), expected_tables(&model));

    let reverted = downgrade(&db, &store, 1).await.unwrap();
    assert_eq!(reverted, vec![change.revision]);
    assert_eq!(live_tables(&db).await.unwrap(), before);
    assert_eq!(current_revision(&db).await.unwrap(), base_marker);

    // Downgrading past the base is bounded by the chain.
    let reverted = downgrade(&db, &store, 5).await.unwrap();
    assert_eq!(reverted.len(), 1);
    assert!(live_tables(&db).await.unwrap().is_empty());
    assert_eq!(current_revision(&db).await.unwrap(), None);
}

#[tokio::test]
async fn branched_history_is_refused() {
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));
    let db = connect(dir.path()).await;

    let base = artifact(None, "base", create_table("alpha"));
    store.write(&base).unwrap();
    store
        .write(&artifact(Some(&base), "left", create_table("left_side")))
        .unwrap();
    store
        .write(&artifact(Some(&base), "right", create_table("right_side")))
        .unwrap();

    let err = generate(&store, &user_model(), "add user table").unwrap_err();
    assert!(matches!(err, MigrationError::Chain { .. }));
    assert_eq!(artifact_files(&store), 3);

    let err = apply(&db, &store).await.unwrap_err();
    assert!(matches!(err, MigrationError::Chain { .. }));
}

#[tokio::test]
async fn marker_outside_the_chain_is_refused() {
    let dir = TempDir::new().expect("Should create temp dir");
    let db = connect(dir.path()).await;

    let original = ArtifactStore::new(dir.path().join("original"));
    generate(&original, &user_model(), "add user table").unwrap();
    apply(&db, &original).await.unwrap();

    let other = ArtifactStore::new(dir.path().join("other"));
    generate(&other, &user_model(), "unrelated history").unwrap();
    let err = apply(&db, &other).await.unwrap_err();
    assert!(err.to_string().contains("not in the artifact store"));
}

#[tokio::test]
async fn shipped_user_model_applies_cleanly() {
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));
    let db = connect(dir.path()).await;
    let model = ModelFile::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../schema/model.json"));

    let artifact = generate(&store, &model, "add user table").unwrap();
    apply(&db, &store).await.unwrap();

    let users = &live_tables(&db).await.unwrap()["users"];
    assert_eq!(users.len(), 8);
    assert!(users.contains(&"hashed_password".to_string()));
    assert_eq!(
        current_revision(&db).await.unwrap(),
        Some(artifact.revision)
    );
}

#[tokio::test]
async fn locked_database_is_not_read_as_base() {
    test_support::logging::init();
    let dir = TempDir::new().expect("Should create temp dir");
    let store = ArtifactStore::new(dir.path().join("migrations"));
    let db = connect(dir.path()).await;

    let first = generate(&store, &user_model(), "add user table").unwrap();
    apply(&db, &store).await.unwrap();

    // Exclusive locking mode keeps the write lock until the connection closes.
    let holder = connect(dir.path()).await;
    for sql in [
        "PRAGMA locking_mode = EXCLUSIVE",
        "UPDATE schema_version SET applied_at = applied_at",
    ] {
        holder
            .execute(Statement::from_string(holder.get_database_backend(), sql))
            .await
            .unwrap();
    }

    let result = current_revision(&db).await;
    assert!(result.is_err(), "expected an error, got {result:?}");
    assert!(apply(&db, &store).await.is_err());

    holder.close().await.unwrap();
    assert_eq!(current_revision(&db).await.unwrap(), Some(first.revision));
}
