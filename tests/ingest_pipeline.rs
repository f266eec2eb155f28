//! End-to-end ingest scenarios against a mocked remote API and a
//! disposable Postgres instance.

use mailcrawl::config::{MailboxConfig, Settings};
use mailcrawl::crawl::progress::{ProgressSink, StageEvent};
use mailcrawl::models::MessagePayload;
use mailcrawl::operations;
use mailcrawl::store;
use mailcrawl::test_support::TestDatabase;
use serde_json::json;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_settings(server: &MockServer, mailboxes: &[MailboxConfig]) -> Settings {
    let mut settings = Settings::from_env();
    settings.token_url = format!("{}/token", server.uri());
    settings.api_endpoint = format!("{}/v1.0", server.uri());
    settings.client_id = "client".to_string();
    settings.client_secret = "secret".to_string();
    settings.max_concurrency = 4;
    settings.page_pause = Duration::from_millis(1);
    settings.with_mailboxes(mailboxes)
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "test-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

async fn mount_json(server: &MockServer, url_path: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(url_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn message_json(remote_id: &str, received: &str) -> serde_json::Value {
    json!({
        "id": remote_id,
        "subject": format!("subject for {remote_id}"),
        "from": {"emailAddress": {"address": "sender@acme.example"}},
        "receivedDateTime": received,
        "bodyPreview": "preview",
        "hasAttachments": false,
        "conversationId": "conv-1",
        "parentFolderId": "folder-a"
    })
}

/// Root with two children: Folder A and Folder B, no deeper levels.
async fn mount_two_folder_tree(server: &MockServer) {
    mount_json(
        server,
        "/v1.0/users/u/mailFolders/root",
        json!({"id": "root-id", "displayName": "Root", "totalItemCount": 0}),
    )
    .await;
    mount_json(
        server,
        "/v1.0/users/u/mailFolders/root-id/childFolders",
        json!({"value": [
            {"id": "folder-a", "displayName": "Folder A", "totalItemCount": 4},
            {"id": "folder-b", "displayName": "Folder B", "totalItemCount": 0}
        ]}),
    )
    .await;
    mount_json(
        server,
        "/v1.0/users/u/mailFolders/folder-a/childFolders",
        json!({"value": []}),
    )
    .await;
    mount_json(
        server,
        "/v1.0/users/u/mailFolders/folder-b/childFolders",
        json!({"value": []}),
    )
    .await;
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<StageEvent>>,
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: StageEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn run_status(pool: &PgPool, run_id_offset: i64) -> (String, i64, i64) {
    sqlx::query_as(
        "SELECT status, processed_count, error_count FROM pipeline_runs ORDER BY id ASC OFFSET $1 LIMIT 1",
    )
    .bind(run_id_offset)
    .fetch_one(pool)
    .await
    .expect("run row")
}

#[tokio::test]
async fn ingest_counts_new_messages_and_advances_watermark() {
    let db = TestDatabase::new().await.expect("test database");
    let pool = db.pool_clone();
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_two_folder_tree(&server).await;

    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/folder-a/messages",
        json!({"value": [
            message_json("m-a3", "2024-03-03T10:00:00Z"),
            message_json("m-a2", "2024-03-02T10:00:00Z"),
            message_json("m-a1", "2024-03-01T10:00:00Z"),
            message_json("m-seen", "2024-02-01T09:00:00Z"),
        ]}),
    )
    .await;
    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/folder-b/messages",
        json!({"value": []}),
    )
    .await;

    let mailbox = MailboxConfig::for_user("u", "root");
    let settings = test_settings(&server, &[mailbox.clone()]);

    // Seed the previously-seen message so the run refreshes rather than
    // inserts it.
    let rows = store::mailboxes::bootstrap_mailboxes(&pool, &[mailbox])
        .await
        .unwrap();
    let mailbox_id = rows["u"].id;
    let seen = message_json("m-seen", "2024-02-01T09:00:00Z");
    let payload = MessagePayload::from_value(&seen).unwrap();
    let mut conn = pool.acquire().await.unwrap();
    store::messages::upsert_message(&mut conn, mailbox_id, &payload, &seen)
        .await
        .unwrap();
    drop(conn);

    let sink = Arc::new(CollectingSink::default());
    let processed = operations::run_ingest(&pool, &settings, None, None, sink.clone())
        .await
        .unwrap();
    assert_eq!(processed, 3, "only the three new messages count");

    // The empty folder is still mirrored.
    let (item_count,): (i32,) = sqlx::query_as(
        "SELECT total_item_count FROM folders WHERE remote_folder_id = 'folder-b'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(item_count, 0);

    // Watermark = max received timestamp of this run.
    let checkpoint =
        store::checkpoint::get_or_create(&pool, mailbox_id, store::checkpoint::INGEST_PIPELINE)
            .await
            .unwrap();
    let watermark = checkpoint.last_synced_at.expect("watermark set");
    assert_eq!(watermark.to_rfc3339(), "2024-03-03T10:00:00+00:00");

    let (status, run_processed, run_errors) = run_status(&pool, 0).await;
    assert_eq!(status, "success");
    assert_eq!(run_processed, 3);
    assert_eq!(run_errors, 0);

    // Progress events for the closed stage set fired.
    {
        let events = sink.events.lock().unwrap();
        assert!(events.iter().any(|event| matches!(
            event,
            StageEvent::DiscoveryComplete { total_folders: 3, target_folders: 3, .. }
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            StageEvent::IngestComplete { processed_messages: 3, errors: 0, .. }
        )));
    }

    // Re-running against the unchanged mailbox processes nothing new.
    let again = operations::run_ingest(&pool, &settings, None, None, sink)
        .await
        .unwrap();
    assert_eq!(again, 0, "second run only refreshes existing rows");

    let reloaded =
        store::checkpoint::get_or_create(&pool, mailbox_id, store::checkpoint::INGEST_PIPELINE)
            .await
            .unwrap();
    assert_eq!(reloaded.last_synced_at, Some(watermark));
}

#[tokio::test]
async fn rate_limited_page_is_retried_after_server_delay() {
    let db = TestDatabase::new().await.expect("test database");
    let pool = db.pool_clone();
    let server = MockServer::start().await;
    mount_token(&server).await;

    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/root",
        json!({"id": "root-id", "displayName": "Root", "totalItemCount": 0}),
    )
    .await;
    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/root-id/childFolders",
        json!({"value": [{"id": "folder-a", "displayName": "Folder A", "totalItemCount": 1}]}),
    )
    .await;
    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/folder-a/childFolders",
        json!({"value": []}),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/v1.0/users/u/mailFolders/folder-a/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/users/u/mailFolders/folder-a/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [message_json("m-1", "2024-03-01T10:00:00Z")]
        })))
        .mount(&server)
        .await;

    let mailbox = MailboxConfig::for_user("u", "root");
    let settings = test_settings(&server, &[mailbox]);

    let started = Instant::now();
    let processed = operations::run_ingest(
        &pool,
        &settings,
        None,
        None,
        Arc::new(mailcrawl::crawl::progress::NullSink),
    )
    .await
    .unwrap();

    assert_eq!(processed, 1);
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "the retry must honor the server-supplied delay"
    );

    let (status, _, run_errors) = run_status(&pool, 0).await;
    assert_eq!(status, "success", "the retried rate limit surfaces no error");
    assert_eq!(run_errors, 0);

    let open = store::dead_letter::open_count(&pool).await.unwrap();
    assert_eq!(open, 0);
}

#[tokio::test]
async fn malformed_message_is_contained_and_dead_lettered() {
    let db = TestDatabase::new().await.expect("test database");
    let pool = db.pool_clone();
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_two_folder_tree(&server).await;

    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/folder-a/messages",
        json!({"value": [
            message_json("m-good", "2024-03-01T10:00:00Z"),
            {"subject": "payload without an id"},
            message_json("m-also-good", "2024-03-02T10:00:00Z"),
        ]}),
    )
    .await;
    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/folder-b/messages",
        json!({"value": []}),
    )
    .await;

    let mailbox = MailboxConfig::for_user("u", "root");
    let settings = test_settings(&server, &[mailbox]);

    let processed = operations::run_ingest(
        &pool,
        &settings,
        None,
        None,
        Arc::new(mailcrawl::crawl::progress::NullSink),
    )
    .await
    .unwrap();

    assert_eq!(processed, 2, "the bad message never aborts the folder pull");

    let (status, run_processed, run_errors) = run_status(&pool, 0).await;
    assert_eq!(status, "partial_success");
    assert_eq!(run_processed, 2);
    assert_eq!(run_errors, 1);

    let (stage,): (String,) =
        sqlx::query_as("SELECT stage FROM dead_letters WHERE resolved_at IS NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(stage, "ingest-message");

    let error_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_errors WHERE stage = 'ingest-message'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(error_count, 1);
}

#[tokio::test]
async fn include_exclude_filters_select_ingestion_targets() {
    let db = TestDatabase::new().await.expect("test database");
    let pool = db.pool_clone();
    let server = MockServer::start().await;
    mount_token(&server).await;

    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/root",
        json!({"id": "root-id", "displayName": "root", "totalItemCount": 0}),
    )
    .await;
    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/root-id/childFolders",
        json!({"value": [{"id": "fin", "displayName": "Finance", "totalItemCount": 2}]}),
    )
    .await;
    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/fin/childFolders",
        json!({"value": [
            {"id": "inv", "displayName": "Invoices", "totalItemCount": 1},
            {"id": "pos", "displayName": "POs", "totalItemCount": 1}
        ]}),
    )
    .await;
    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/inv/childFolders",
        json!({"value": []}),
    )
    .await;
    mount_json(
        &server,
        "/v1.0/users/u/mailFolders/pos/childFolders",
        json!({"value": []}),
    )
    .await;

    // Only the retained folders may be pulled at all.
    Mock::given(method("GET"))
        .and(path("/v1.0/users/u/mailFolders/inv/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/users/u/mailFolders/fin/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/users/u/mailFolders/pos/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [message_json("m-po", "2024-03-01T10:00:00Z")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut mailbox = MailboxConfig::for_user("u", "root");
    mailbox.include_filters = vec!["finance".to_string()];
    mailbox.exclude_filters = vec!["invoices".to_string()];
    let settings = test_settings(&server, &[mailbox]);

    let processed = operations::run_ingest(
        &pool,
        &settings,
        None,
        None,
        Arc::new(mailcrawl::crawl::progress::NullSink),
    )
    .await
    .unwrap();
    assert_eq!(processed, 1);

    // The excluded folder is still mirrored in the store.
    let mirrored: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM folders WHERE remote_folder_id = 'inv'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(mirrored, 1);
}

#[tokio::test]
async fn unknown_mailbox_key_is_rejected() {
    let db = TestDatabase::new().await.expect("test database");
    let pool = db.pool_clone();
    let server = MockServer::start().await;

    let mailbox = MailboxConfig::for_user("u", "root");
    let settings = test_settings(&server, &[mailbox]);

    let result = operations::run_ingest(
        &pool,
        &settings,
        None,
        Some("missing"),
        Arc::new(mailcrawl::crawl::progress::NullSink),
    )
    .await;
    assert!(result.is_err());
}
