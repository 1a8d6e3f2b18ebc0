mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{multipart, xlsx, xlsx_with_sheet, TestService};
use serde_json::{json, Value};
use tower::util::ServiceExt;

async fn send(svc: &TestService, req: Request<Body>) -> (StatusCode, Value) {
    let resp = svc.router().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn upload(field: &str, bytes: &[u8]) -> Request<Body> {
    let (content_type, body) = multipart(field, "sheet.xlsx", bytes);
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn upload_then_fetch_page() {
    let svc = TestService::new();
    let (status, body) = send(&svc, upload("file", &xlsx(&[&["Name"], &["Alice"]]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "upload succeeded");
    let table = body["tableName"].as_str().unwrap().to_string();

    let (status, body) = send(&svc, get("/data")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"tableName": table, "data": [{"id": 1, "Name": "Alice"}], "total": 1})
    );
}

#[tokio::test]
async fn data_response_is_json() {
    let svc = TestService::new();
    send(&svc, upload("file", &xlsx(&[&["a"], &["1"]]))).await;
    let resp = svc.router().oneshot(get("/data?page=1&limit=5")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
}

#[tokio::test]
async fn upload_without_file_field_is_400() {
    let svc = TestService::new();
    let (status, body) = send(&svc, upload("attachment", b"Name\nAlice\n")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "please upload a file");
}

#[tokio::test]
async fn header_only_upload_is_400() {
    let svc = TestService::new();
    let (status, body) = send(&svc, upload("file", &xlsx(&[&["Name"]]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["message"],
        "file format error: at least 1 header row and 1 data row required"
    );
    assert!(svc.store.list_tables().unwrap().is_empty());
}

#[tokio::test]
async fn legacy_xls_is_400() {
    let svc = TestService::new();
    let bytes = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
    let (status, body) = send(&svc, upload("file", &bytes)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains(".xls"));
}

#[tokio::test]
async fn cell_past_sheet_bounds_is_400() {
    let svc = TestService::new();
    let sheet = r#"<worksheet><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Name</t></is></c><c r="ZZZZZZZ1" t="inlineStr"><is><t>x</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>Alice</t></is></c></row></sheetData></worksheet>"#;
    let (status, body) = send(&svc, upload("file", &xlsx_with_sheet(sheet.to_string()))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("ZZZZZZZ1"));
    assert!(svc.store.list_tables().unwrap().is_empty());

    let (status, _) = send(&svc, upload("file", &xlsx(&[&["Name"], &["Alice"]]))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn insert_failure_is_500_with_detail() {
    let svc = TestService::new();
    let (status, body) = send(&svc, upload("file", &xlsx(&[&["a"], &["1", "2"]]))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "failed to insert data");
    assert!(body["error"].as_str().unwrap().contains("column count"));
}

#[tokio::test]
async fn data_before_upload_is_500() {
    let svc = TestService::new();
    let (status, body) = send(&svc, get("/data")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"message": "no latest table found"}));
}

#[tokio::test]
async fn query_params_fall_back_to_defaults() {
    let svc = TestService::new();
    let mut rows = vec![vec!["n".to_string()]];
    rows.extend((1..=15).map(|i| vec![i.to_string()]));
    let borrowed: Vec<Vec<&str>> = rows
        .iter()
        .map(|r| r.iter().map(String::as_str).collect())
        .collect();
    let slices: Vec<&[&str]> = borrowed.iter().map(Vec::as_slice).collect();
    send(&svc, upload("file", &xlsx(&slices))).await;

    let (_, body) = send(&svc, get("/data?page=abc&limit=0")).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 10);
    assert_eq!(body["total"], 15);

    let (_, body) = send(&svc, get("/data?page=2&limit=10&search=1")).await;
    // "1", "10".."15" and the ids containing a 1 match; 7 rows in all.
    assert_eq!(body["total"], 7);
    assert!(body["data"].as_array().unwrap().is_empty());

    let (status, _) = send(&svc, get("/data?limit=-1")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn prune_keeps_latest_table() {
    let svc = TestService::new();
    for value in ["1", "2", "3"] {
        send(&svc, upload("file", &xlsx(&[&["a"], &[value]]))).await;
        std::thread::sleep(std::time::Duration::from_millis(3));
    }
    let req = Request::builder()
        .method("POST")
        .uri("/admin/prune?keep=1")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&svc, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dropped"].as_array().unwrap().len(), 2);

    let (status, body) = send(&svc, get("/data")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["a"], "3");
}

#[tokio::test]
async fn health_reports_version() {
    let svc = TestService::new();
    let (status, body) = send(&svc, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn binary_serves_uploads() -> anyhow::Result<()> {
    let (_server, addr) = common::spawn_server()?;

    let (status, body) = common::http_request(addr, "GET", "/health", None, b"")?;
    assert_eq!(status, 200, "{body}");

    let (content_type, payload) = multipart("file", "people.csv", b"Name\nAlice\n");
    let (status, body) =
        common::http_request(addr, "POST", "/upload", Some(&content_type), &payload)?;
    assert_eq!(status, 200, "{body}");

    let (status, body) = common::http_request(addr, "GET", "/data", None, b"")?;
    assert_eq!(status, 200);
    let env: Value = serde_json::from_str(&body)?;
    assert_eq!(env["data"], json!([{"id": 1, "Name": "Alice"}]));
    Ok(())
}
