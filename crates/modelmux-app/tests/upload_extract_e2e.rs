//! End-to-end ingestion tests against a real gateway over a temp data dir:
//! upload, sniffing, extraction, retention bookkeeping, and the delete law.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use modelmux_app::Gateway;
use modelmux_app::config::AppConfig;
use modelmux_server::{
    ByteStream, GatewayError, GatewayErrorKind, GatewayService, Identity, RequestScope, Upload,
};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn stream_of(chunks: Vec<Vec<u8>>) -> ByteStream {
    Box::pin(futures::stream::iter(
        chunks.into_iter().map(|c| Ok::<_, GatewayError>(Bytes::from(c))),
    ))
}

fn scope(name: &str) -> RequestScope {
    RequestScope::new(format!("req-{name}"), Identity::ApiKey(name.to_string()))
}

fn ip_scope(last: u8) -> RequestScope {
    let ip: IpAddr = format!("10.0.0.{last}").parse().unwrap();
    RequestScope::new(format!("req-ip-{last}"), Identity::Ip(ip))
}

async fn gateway_in(dir: &TempDir, max_file_bytes: u64) -> Arc<Gateway> {
    let mut config = AppConfig::default();
    config.storage.data_dir = Some(dir.path().to_path_buf());
    config.storage.max_file_bytes = max_file_bytes;
    Gateway::bootstrap(config).await.expect("gateway bootstraps")
}

fn text_upload(name: &str, content: &[u8]) -> Upload {
    Upload {
        declared_name: name.to_string(),
        declared_mime: "text/plain".to_string(),
        data: stream_of(vec![content.to_vec()]),
    }
}

#[tokio::test]
async fn upload_round_trips_bytes_hash_and_metadata() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 1024 * 1024).await;
    let scope = scope("alice");

    let payload = b"hello gateway, this is a plain text file".to_vec();
    let record = gateway
        .upload(&scope, text_upload("notes.txt", &payload))
        .await
        .unwrap();

    assert_eq!(record.size, payload.len() as u64);
    assert_eq!(record.detected_mime, "text/plain");
    assert_eq!(record.filename, "notes.txt");
    assert_eq!(record.sha256, format!("{:x}", Sha256::digest(&payload)));
    assert_eq!(record.extraction_status, "pending");

    let fetched = gateway.file_record(&scope, &record.id).await.unwrap();
    assert_eq!(fetched.sha256, record.sha256);

    let listed = gateway.list_files(&scope).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, record.id);
}

#[tokio::test]
async fn extraction_is_idempotent_and_marks_ready() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 1024 * 1024).await;
    let scope = scope("bob");

    let record = gateway
        .upload(&scope, text_upload("doc.txt", b"extract me please"))
        .await
        .unwrap();

    let first = gateway.extract(&scope, &record.id).await.unwrap();
    assert_eq!(first.kind, "text");
    assert_eq!(first.text, "extract me please");
    assert!(!first.truncated);

    let second = gateway.extract(&scope, &record.id).await.unwrap();
    assert_eq!(first.text, second.text);
    assert_eq!(first.kind, second.kind);
    assert_eq!(first.extractor_id, second.extractor_id);
    assert_eq!(first.extractor_version, second.extractor_version);

    let fetched = gateway.file_record(&scope, &record.id).await.unwrap();
    assert_eq!(fetched.extraction_status, "ready");
}

#[tokio::test]
async fn oversize_upload_fails_with_no_residue() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 16).await;
    let scope = scope("carol");

    // Exactly at the cap succeeds.
    let exact = gateway
        .upload(&scope, text_upload("exact.txt", &[b'a'; 16]))
        .await
        .unwrap();
    assert_eq!(exact.size, 16);

    // One byte over fails with the typed error and leaves nothing behind.
    let err = gateway
        .upload(&scope, text_upload("big.txt", &[b'a'; 17]))
        .await
        .unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::PayloadTooLarge);

    let listed = gateway.list_files(&scope).await.unwrap();
    assert_eq!(listed.len(), 1, "only the in-cap upload is recorded");

    let staging = dir.path().join("staging");
    let mut entries = tokio::fs::read_dir(&staging).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn disallowed_detected_type_is_rejected() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 1024).await;
    let scope = scope("dave");

    let upload = Upload {
        declared_name: "payload.txt".to_string(),
        // Declared type lies; the sniffed type (octet-stream) decides.
        declared_mime: "text/plain".to_string(),
        data: stream_of(vec![vec![0x00, 0x01, 0x02, 0x03, 0xFF]]),
    };
    let err = gateway.upload(&scope, upload).await.unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::UnsupportedType);
    assert!(gateway.list_files(&scope).await.unwrap().is_empty());
}

#[tokio::test]
async fn upload_get_delete_get_yields_not_found() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 1024).await;
    let scope = scope("erin");

    let record = gateway
        .upload(&scope, text_upload("temp.txt", b"short lived"))
        .await
        .unwrap();
    assert!(gateway.file_record(&scope, &record.id).await.is_ok());

    gateway.delete_file(&scope, &record.id).await.unwrap();

    let err = gateway.file_record(&scope, &record.id).await.unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::NotFound);
}

#[tokio::test]
async fn files_are_scoped_to_their_uploader() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 1024).await;

    let alice = scope("alice");
    let record = gateway
        .upload(&alice, text_upload("private.txt", b"mine"))
        .await
        .unwrap();

    let intruder = ip_scope(9);
    let err = gateway.file_record(&intruder, &record.id).await.unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::Forbidden);
    assert!(gateway.list_files(&intruder).await.unwrap().is_empty());
}

#[tokio::test]
async fn traversal_filenames_are_sanitized() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 1024).await;
    let scope = scope("frank");

    let record = gateway
        .upload(&scope, text_upload("../../etc/passwd", b"not a real passwd"))
        .await
        .unwrap();
    assert_eq!(record.filename, "passwd");
    assert_eq!(record.original_filename, "../../etc/passwd");
    assert!(!record.filename.contains('/'));
}

#[tokio::test]
async fn json_uploads_detect_and_extract_structurally() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 4096).await;
    let scope = scope("grace");

    let record = gateway
        .upload(
            &scope,
            Upload {
                declared_name: "data.json".to_string(),
                declared_mime: "application/json".to_string(),
                data: stream_of(vec![br#"{"answer": 42, "items": [1, 2]}"#.to_vec()]),
            },
        )
        .await
        .unwrap();
    assert_eq!(record.detected_mime, "application/json");

    let extraction = gateway.extract(&scope, &record.id).await.unwrap();
    assert_eq!(extraction.kind, "structured-json");
    assert!(extraction.text.contains("answer"));
    assert_eq!(extraction.metadata["type"], "object");
}

#[tokio::test]
async fn analyze_scores_attached_files_without_upstream() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_in(&dir, 1024 * 1024).await;
    let scope = scope("heidi");

    let payload = vec![b'x'; 120 * 1024];
    let record = gateway
        .upload(&scope, text_upload("large.txt", &payload))
        .await
        .unwrap();

    let request = serde_json::from_value(serde_json::json!({
        "messages": [{"role": "user", "content": "Summarize"}],
        "file_ids": [record.id],
    }))
    .unwrap();

    let analysis = gateway.analyze(&scope, request).await.unwrap();
    assert!(analysis.complexity.score >= 5, "file reference adds points");
    assert!(
        analysis
            .complexity
            .required_capabilities
            .contains(&"long-context".to_string()),
        "120 KiB of text forces long context"
    );
    assert!(!analysis.route.model.is_empty());

    // Determinism: a second run scores and routes identically.
    let request2 = serde_json::from_value(serde_json::json!({
        "messages": [{"role": "user", "content": "Summarize"}],
        "file_ids": [analysis_file_id(&gateway, &scope).await],
    }))
    .unwrap();
    let again = gateway.analyze(&scope, request2).await.unwrap();
    assert_eq!(analysis.complexity.score, again.complexity.score);
    assert_eq!(analysis.route.model, again.route.model);
}

async fn analysis_file_id(gateway: &Gateway, scope: &RequestScope) -> String {
    gateway.list_files(scope).await.unwrap()[0].id.clone()
}
