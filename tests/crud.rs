//! Basic document CRUD against a single database instance.

use bundoc::db::{Config, Database, Isolation};
use bundoc::DbError;
use serde_json::json;
use tempfile::tempdir;

fn open_db(dir: &std::path::Path) -> Database {
    Database::open(dir, Config::small()).expect("open database")
}

#[test]
fn insert_get_patch_delete_lifecycle() {
    let dir = tempdir().expect("tmpdir");
    let db = open_db(dir.path());
    db.create_collection("users", None, None).expect("create collection");

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.insert("users", json!({"_id": "u1", "name": "Alice"}))
        .expect("insert");
    tx.commit().expect("commit insert");

    let mut tx = db.begin(Isolation::ReadCommitted);
    let doc = tx.find_by_id("users", "u1").expect("find");
    assert_eq!(doc.to_value(), json!({"_id": "u1", "name": "Alice"}));
    tx.commit().expect("commit read");

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.patch("users", "u1", json!({"name": "Bob"})).expect("patch");
    tx.commit().expect("commit patch");

    let mut tx = db.begin(Isolation::ReadCommitted);
    let doc = tx.find_by_id("users", "u1").expect("find patched");
    assert_eq!(doc.to_value(), json!({"_id": "u1", "name": "Bob"}));
    tx.commit().expect("commit read");

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.delete("users", "u1").expect("delete");
    tx.commit().expect("commit delete");

    let mut tx = db.begin(Isolation::ReadCommitted);
    match tx.find_by_id("users", "u1") {
        Err(DbError::DocumentNotFound(id)) => assert_eq!(id, "u1"),
        other => panic!("expected not found, got {other:?}"),
    }
    tx.commit().expect("commit read");
}

#[test]
fn duplicate_id_insert_is_rejected() {
    let dir = tempdir().expect("tmpdir");
    let db = open_db(dir.path());
    db.create_collection("users", None, None).expect("create");

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.insert("users", json!({"_id": "u1", "n": 1})).expect("first insert");
    tx.commit().expect("commit");

    let mut tx = db.begin(Isolation::ReadCommitted);
    match tx.insert("users", json!({"_id": "u1", "n": 2})) {
        Err(DbError::DuplicateKey(id)) => assert_eq!(id, "u1"),
        other => panic!("expected duplicate key, got {other:?}"),
    }
    tx.rollback();

    // Original document unchanged.
    let mut tx = db.begin(Isolation::ReadCommitted);
    let doc = tx.find_by_id("users", "u1").expect("find");
    assert_eq!(doc.get("n"), Some(&json!(1)));
    tx.commit().expect("commit");
}

#[test]
fn insert_generates_ulid_when_id_absent() {
    let dir = tempdir().expect("tmpdir");
    let db = open_db(dir.path());
    db.create_collection("users", None, None).expect("create");

    let mut tx = db.begin(Isolation::ReadCommitted);
    let doc = tx.insert("users", json!({"name": "Anon"})).expect("insert");
    let id = doc.id().expect("generated id").to_string();
    tx.commit().expect("commit");
    assert_eq!(id.len(), 26);

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.find_by_id("users", &id).expect("find by generated id");
    tx.commit().expect("commit");
}

#[test]
fn patch_stores_explicit_null_as_value() {
    let dir = tempdir().expect("tmpdir");
    let db = open_db(dir.path());
    db.create_collection("posts", None, None).expect("create");

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.insert("posts", json!({"_id": "p1", "author_id": "u1", "title": "hello"}))
        .expect("insert");
    tx.commit().expect("commit");

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.patch("posts", "p1", json!({"author_id": null})).expect("patch null");
    tx.commit().expect("commit");

    let mut tx = db.begin(Isolation::ReadCommitted);
    let doc = tx.find_by_id("posts", "p1").expect("find");
    // The field exists and is null, not removed.
    assert_eq!(doc.get("author_id"), Some(&json!(null)));
    assert_eq!(doc.get("title"), Some(&json!("hello")));
    tx.commit().expect("commit");
}

#[test]
fn update_replaces_whole_document() {
    let dir = tempdir().expect("tmpdir");
    let db = open_db(dir.path());
    db.create_collection("users", None, None).expect("create");

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.insert("users", json!({"_id": "u1", "name": "Alice", "age": 30}))
        .expect("insert");
    tx.commit().expect("commit");

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.update("users", "u1", json!({"name": "Alicia"})).expect("update");
    tx.commit().expect("commit");

    let mut tx = db.begin(Isolation::ReadCommitted);
    let doc = tx.find_by_id("users", "u1").expect("find");
    assert_eq!(doc.to_value(), json!({"_id": "u1", "name": "Alicia"}));
    assert!(doc.get("age").is_none(), "full replace drops old fields");
    tx.commit().expect("commit");
}

#[test]
fn operations_on_missing_collections_fail() {
    let dir = tempdir().expect("tmpdir");
    let db = open_db(dir.path());

    let mut tx = db.begin(Isolation::ReadCommitted);
    match tx.insert("nope", json!({"a": 1})) {
        Err(DbError::CollectionNotFound(name)) => assert_eq!(name, "nope"),
        other => panic!("expected collection not found, got {other:?}"),
    }
    match tx.find_by_id("nope", "x") {
        Err(DbError::CollectionNotFound(_)) => {}
        other => panic!("expected collection not found, got {other:?}"),
    }
    tx.rollback();
}

#[test]
fn schema_validation_rejects_bad_documents() {
    let dir = tempdir().expect("tmpdir");
    let db = open_db(dir.path());
    db.create_collection(
        "users",
        Some(json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"}
            }
        })),
        None,
    )
    .expect("create");

    let mut tx = db.begin(Isolation::ReadCommitted);
    match tx.insert("users", json!({"_id": "u1", "age": "old"})) {
        Err(DbError::SchemaViolation(_)) => {}
        other => panic!("expected schema violation, got {other:?}"),
    }
    tx.rollback();

    let mut tx = db.begin(Isolation::ReadCommitted);
    tx.insert("users", json!({"_id": "u1", "name": "Alice", "age": 30}))
        .expect("valid insert");
    tx.commit().expect("commit");
}

#[test]
fn list_orders_by_id_and_caps() {
    let dir = tempdir().expect("tmpdir");
    let db = open_db(dir.path());
    db.create_collection("items", None, None).expect("create");

    let mut tx = db.begin(Isolation::ReadCommitted);
    for i in [3, 1, 2, 5, 4] {
        tx.insert("items", json!({"_id": format!("i{i}"), "n": i}))
            .expect("insert");
    }
    tx.commit().expect("commit");

    let mut tx = db.begin(Isolation::ReadCommitted);
    let (docs, truncated) = tx.list("items", 0).expect("list all");
    assert!(!truncated);
    let ids: Vec<&str> = docs.iter().filter_map(|d| d.id()).collect();
    assert_eq!(ids, vec!["i1", "i2", "i3", "i4", "i5"]);

    let (docs, truncated) = tx.list("items", 3).expect("list capped");
    assert!(truncated);
    assert_eq!(docs.len(), 3);
    tx.commit().expect("commit");
}

#[test]
fn many_documents_survive_reopen() {
    let dir = tempdir().expect("tmpdir");
    {
        let db = open_db(dir.path());
        db.create_collection("bulk", None, None).expect("create");
        // Enough to split leaves several times.
        let mut tx = db.begin(Isolation::ReadCommitted);
        for i in 0..500 {
            tx.insert("bulk", json!({"_id": format!("doc-{i:05}"), "i": i}))
                .expect("insert");
        }
        tx.commit().expect("commit bulk");
        db.close().expect("close");
    }

    let db = open_db(dir.path());
    let mut tx = db.begin(Isolation::ReadCommitted);
    for i in (0..500).step_by(37) {
        let doc = tx
            .find_by_id("bulk", &format!("doc-{i:05}"))
            .expect("find after reopen");
        assert_eq!(doc.get("i"), Some(&json!(i)));
    }
    let (docs, _) = tx.list("bulk", 0).expect("list");
    assert_eq!(docs.len(), 500);
    tx.commit().expect("commit");
}
