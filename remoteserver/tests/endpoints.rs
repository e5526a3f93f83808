//! Integration tests against a running `damshare-remoteserver` instance,
//! in the teacher's `server/tests/endpoints.rs` style: a fixed base URL,
//! one `#[tokio::test]` per endpoint behavior.

use reqwest::{Client, StatusCode};

const BASE_URL: &str = "http://127.0.0.1:8080";

#[tokio::test]
async fn health_endpoint_ok() {
    let response = reqwest::get(format!("{BASE_URL}/health")).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let client = Client::new();
    let put = client
        .put(format!("{BASE_URL}/files/endpoints_roundtrip.txt"))
        .body("hello")
        .send()
        .await
        .expect("request failed");
    assert_eq!(put.status(), StatusCode::OK);

    let get = client
        .get(format!("{BASE_URL}/files/endpoints_roundtrip.txt"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(get.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn create_on_existing_path_returns_conflict() {
    let client = Client::new();
    let path = format!("{BASE_URL}/files/endpoints_conflict.txt");
    client.put(&path).body("v1").send().await.unwrap();
    let second = client.put(&path).body("v2").send().await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn update_on_missing_path_returns_not_found() {
    let client = Client::new();
    let response = client
        .post(format!("{BASE_URL}/files/endpoints_missing_update.txt"))
        .body("v1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_on_missing_path_returns_not_found() {
    let client = Client::new();
    let response = client
        .delete(format!("{BASE_URL}/files/endpoints_never_existed.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn range_request_returns_partial_content() {
    let client = Client::new();
    let path = format!("{BASE_URL}/files/endpoints_range.txt");
    client.put(&path).body("0123456789").send().await.unwrap();

    let response = client.get(&path).header("Range", "bytes=2-5").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "2345");
}

#[tokio::test]
async fn mkdir_then_list_is_empty() {
    let client = Client::new();
    let create = client.post(format!("{BASE_URL}/mkdir/endpoints_empty_dir")).send().await.unwrap();
    assert_eq!(create.status(), StatusCode::OK);

    let list = client.get(format!("{BASE_URL}/list/endpoints_empty_dir")).send().await.unwrap();
    assert_eq!(list.status(), StatusCode::OK);
    let body: Vec<serde_json::Value> = list.json().await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn rename_moves_resource() {
    let client = Client::new();
    client.put(format!("{BASE_URL}/files/endpoints_rename_src.txt")).body("v1").send().await.unwrap();

    let patch = client
        .patch(format!("{BASE_URL}/files/endpoints_rename_src.txt"))
        .json(&serde_json::json!({ "destination": "endpoints_rename_dst.txt" }))
        .send()
        .await
        .unwrap();
    assert_eq!(patch.status(), StatusCode::OK);

    let get = client.get(format!("{BASE_URL}/files/endpoints_rename_dst.txt")).send().await.unwrap();
    assert_eq!(get.status(), StatusCode::OK);
}
