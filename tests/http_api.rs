//! REST façade end-to-end: literal request/response scenarios.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bundoc::db::Config;
use bundoc::server::{build_router, InstanceManager, InstanceManagerConfig, ServerState};
use serde_json::{json, Value};
use tempfile::tempdir;

async fn spawn_server(dir: &std::path::Path) -> (SocketAddr, Arc<InstanceManager>) {
    let mut config = InstanceManagerConfig::new(dir.to_path_buf());
    config.db_config = Config::small();
    config.eviction_interval = Duration::from_secs(3600);
    let manager = InstanceManager::new(config);

    let state = Arc::new(ServerState {
        manager: Arc::clone(&manager),
    });
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .await
            .expect("serve");
    });
    (addr, manager)
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

const P1: &str = "/v1/projects/p1/databases/(default)";

#[tokio::test]
async fn basic_crud_over_http() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    // Create the collection.
    let response = client
        .post(url(addr, &format!("{P1}/collections")))
        .json(&json!({"name": "users"}))
        .send()
        .await
        .expect("create collection");
    assert_eq!(response.status(), 201);

    // POST document.
    let response = client
        .post(url(addr, &format!("{P1}/documents/users")))
        .json(&json!({"_id": "u1", "name": "Alice"}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 201);

    // GET it back.
    let response = client
        .get(url(addr, &format!("{P1}/documents/users/u1")))
        .send()
        .await
        .expect("get");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body, json!({"_id": "u1", "name": "Alice"}));

    // PATCH.
    let response = client
        .patch(url(addr, &format!("{P1}/documents/users/u1")))
        .json(&json!({"name": "Bob"}))
        .send()
        .await
        .expect("patch");
    assert_eq!(response.status(), 200);

    let body: Value = client
        .get(url(addr, &format!("{P1}/documents/users/u1")))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("json");
    assert_eq!(body, json!({"_id": "u1", "name": "Bob"}));

    // DELETE, then GET 404.
    let response = client
        .delete(url(addr, &format!("{P1}/documents/users/u1")))
        .send()
        .await
        .expect("delete");
    assert_eq!(response.status(), 204);

    let response = client
        .get(url(addr, &format!("{P1}/documents/users/u1")))
        .send()
        .await
        .expect("get deleted");
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"], "document_not_found");

    manager.shutdown();
}

#[tokio::test]
async fn duplicate_post_conflicts() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    client
        .post(url(addr, &format!("{P1}/collections")))
        .json(&json!({"name": "users"}))
        .send()
        .await
        .expect("create collection");

    let first = client
        .post(url(addr, &format!("{P1}/documents/users")))
        .json(&json!({"_id": "u1"}))
        .send()
        .await
        .expect("first post");
    assert_eq!(first.status(), 201);

    let second = client
        .post(url(addr, &format!("{P1}/documents/users")))
        .json(&json!({"_id": "u1"}))
        .send()
        .await
        .expect("second post");
    assert_eq!(second.status(), 409);
    let body: Value = second.json().await.expect("json");
    assert_eq!(body["error"], "duplicate_key");

    manager.shutdown();
}

#[tokio::test]
async fn concurrent_posts_of_one_id_yield_single_201() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    client
        .post(url(addr, &format!("{P1}/collections")))
        .json(&json!({"name": "users"}))
        .send()
        .await
        .expect("create collection");

    // Fire the colliding inserts together; uniqueness must admit one.
    let mut tasks = Vec::new();
    for w in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let response = client
                .post(url(addr, &format!("{P1}/documents/users")))
                .json(&json!({"_id": "contested", "w": w}))
                .send()
                .await
                .expect("post");
            let status = response.status();
            let body: Value = response.json().await.expect("json");
            (status, body)
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for task in tasks {
        let (status, body) = task.await.expect("task");
        match status.as_u16() {
            201 => created += 1,
            409 => {
                assert_eq!(body["error"], "duplicate_key");
                conflicts += 1;
            }
            other => panic!("unexpected status {other}: {body}"),
        }
    }
    assert_eq!(created, 1, "exactly one POST wins the id");
    assert_eq!(conflicts, 7, "every loser reports duplicate_key");

    // The winner's document is the only one stored.
    let list: Value = client
        .get(url(addr, &format!("{P1}/documents/users")))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("json");
    assert_eq!(list["documents"].as_array().expect("array").len(), 1);

    manager.shutdown();
}

#[tokio::test]
async fn reference_policies_over_http() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    for (project, on_delete) in [("restrict", "restrict"), ("setnull", "set_null"), ("cascade", "cascade")] {
        let base = format!("/v1/projects/{project}/databases/(default)");
        client
            .post(url(addr, &format!("{base}/collections")))
            .json(&json!({"name": "users"}))
            .send()
            .await
            .expect("create users");
        client
            .post(url(addr, &format!("{base}/collections")))
            .json(&json!({
                "name": "posts",
                "schema": {
                    "properties": {
                        "author_id": {
                            "type": ["string", "null"],
                            "x-bundoc-ref": {"collection": "users", "on_delete": on_delete}
                        }
                    }
                }
            }))
            .send()
            .await
            .expect("create posts");

        client
            .post(url(addr, &format!("{base}/documents/users")))
            .json(&json!({"_id": "u1"}))
            .send()
            .await
            .expect("insert user");
        client
            .post(url(addr, &format!("{base}/documents/posts")))
            .json(&json!({"_id": "p1", "author_id": "u1"}))
            .send()
            .await
            .expect("insert post");

        let delete = client
            .delete(url(addr, &format!("{base}/documents/users/u1")))
            .send()
            .await
            .expect("delete user");
        let post = client
            .get(url(addr, &format!("{base}/documents/posts/p1")))
            .send()
            .await
            .expect("get post");

        match on_delete {
            "restrict" => {
                assert_eq!(delete.status(), 409);
                let body: Value = delete.json().await.expect("json");
                assert_eq!(body["error"], "reference_restrict_violation");
                assert_eq!(post.status(), 200, "post still readable");
            }
            "set_null" => {
                assert_eq!(delete.status(), 204);
                assert_eq!(post.status(), 200);
                let body: Value = post.json().await.expect("json");
                assert_eq!(body, json!({"_id": "p1", "author_id": null}));
            }
            "cascade" => {
                assert_eq!(delete.status(), 204);
                assert_eq!(post.status(), 404);
            }
            _ => unreachable!(),
        }
    }

    manager.shutdown();
}

#[tokio::test]
async fn missing_reference_target_conflicts() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    client
        .post(url(addr, &format!("{P1}/collections")))
        .json(&json!({"name": "users"}))
        .send()
        .await
        .expect("create users");
    client
        .post(url(addr, &format!("{P1}/collections")))
        .json(&json!({
            "name": "posts",
            "schema": {
                "properties": {
                    "author_id": {
                        "type": "string",
                        "x-bundoc-ref": {"collection": "users"}
                    }
                }
            }
        }))
        .send()
        .await
        .expect("create posts");

    let response = client
        .post(url(addr, &format!("{P1}/documents/posts")))
        .json(&json!({"_id": "p1", "author_id": "nobody"}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"], "reference_target_not_found");

    manager.shutdown();
}

#[tokio::test]
async fn schema_violations_are_bad_requests() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    client
        .post(url(addr, &format!("{P1}/collections")))
        .json(&json!({
            "name": "users",
            "schema": {"properties": {"age": {"type": "integer"}}}
        }))
        .send()
        .await
        .expect("create");

    let response = client
        .post(url(addr, &format!("{P1}/documents/users")))
        .json(&json!({"age": "old"}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"], "schema_violation");

    // Tightening the schema later applies to subsequent writes.
    let response = client
        .patch(url(addr, &format!("{P1}/collections/users")))
        .json(&json!({"schema": {"required": ["age"]}}))
        .send()
        .await
        .expect("patch schema");
    assert_eq!(response.status(), 200);

    let response = client
        .post(url(addr, &format!("{P1}/documents/users")))
        .json(&json!({"name": "ageless"}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 400);

    manager.shutdown();
}

#[tokio::test]
async fn health_and_listing_endpoints() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(url(addr, "/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(health["status"], "ok");

    client
        .post(url(addr, &format!("{P1}/collections")))
        .json(&json!({"name": "items", "rules": {"create": "request.auth != null"}}))
        .send()
        .await
        .expect("create");

    for i in 0..5 {
        client
            .post(url(addr, &format!("{P1}/documents/items")))
            .json(&json!({"_id": format!("i{i}")}))
            .send()
            .await
            .expect("post");
    }

    let collections: Value = client
        .get(url(addr, &format!("{P1}/collections")))
        .send()
        .await
        .expect("list collections")
        .json()
        .await
        .expect("json");
    assert_eq!(collections["collections"], json!(["items"]));

    let info: Value = client
        .get(url(addr, &format!("{P1}/collections/items")))
        .send()
        .await
        .expect("get collection")
        .json()
        .await
        .expect("json");
    assert_eq!(info["rules"]["create"], "request.auth != null");

    let list: Value = client
        .get(url(addr, &format!("{P1}/documents/items?limit=3")))
        .send()
        .await
        .expect("list docs")
        .json()
        .await
        .expect("json");
    assert_eq!(list["documents"].as_array().expect("array").len(), 3);
    assert_eq!(list["truncated"], true);

    let health: Value = client
        .get(url(addr, "/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(health["instances"], 1);

    manager.shutdown();
}

#[tokio::test]
async fn projects_are_isolated_over_http() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    for i in 0..5 {
        let base = format!("/v1/projects/proj-{i}/databases/(default)");
        client
            .post(url(addr, &format!("{base}/collections")))
            .json(&json!({"name": "users"}))
            .send()
            .await
            .expect("create");
        let response = client
            .post(url(addr, &format!("{base}/documents/users")))
            .json(&json!({"_id": "shared", "projectID": i}))
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), 201);
    }

    for i in 0..5 {
        let base = format!("/v1/projects/proj-{i}/databases/(default)");
        let body: Value = client
            .get(url(addr, &format!("{base}/documents/users/shared")))
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(body["projectID"], i);
    }

    manager.shutdown();
}

#[tokio::test]
async fn concurrent_writers_across_projects() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    for p in 0..4 {
        client
            .post(url(
                addr,
                &format!("/v1/projects/load-{p}/databases/(default)/collections"),
            ))
            .json(&json!({"name": "load"}))
            .send()
            .await
            .expect("create");
    }

    let mut tasks = Vec::new();
    for worker in 0..12 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let project = worker % 4;
            let mut ok = 0;
            for i in 0..25 {
                let response = client
                    .post(url(
                        addr,
                        &format!("/v1/projects/load-{project}/databases/(default)/documents/load"),
                    ))
                    .json(&json!({"_id": format!("doc-{worker}-{i}"), "w": worker}))
                    .send()
                    .await
                    .expect("post");
                if response.status() == 201 {
                    ok += 1;
                }
            }
            (worker, ok)
        }));
    }

    let mut total_ok = 0;
    for task in tasks {
        let (_, ok) = task.await.expect("task");
        total_ok += ok;
    }
    assert_eq!(total_ok, 12 * 25, "every insert succeeds");

    // Every successfully posted doc is retrievable by id.
    for worker in 0..12 {
        let project = worker % 4;
        for i in (0..25).step_by(6) {
            let response = client
                .get(url(
                    addr,
                    &format!(
                        "/v1/projects/load-{project}/databases/(default)/documents/load/doc-{worker}-{i}"
                    ),
                ))
                .send()
                .await
                .expect("get");
            assert_eq!(response.status(), 200);
        }
    }

    manager.shutdown();
}

#[tokio::test]
async fn cors_preflight_allows_any_origin() {
    let dir = tempdir().expect("tmpdir");
    let (addr, manager) = spawn_server(dir.path()).await;
    let client = reqwest::Client::new();

    let response = client
        .request(
            reqwest::Method::OPTIONS,
            url(addr, &format!("{P1}/documents/users")),
        )
        .header("Origin", "https://example.com")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .expect("preflight");
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );

    manager.shutdown();
}
