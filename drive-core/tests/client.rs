use std::time::Duration;

use drive_core::{ApiErrorClass, DriveClient, DriveError, DriveService};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn get_about_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/about"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "largest_change_id": 42,
            "quota_bytes_total": 1024,
            "quota_bytes_used": 256,
            "root_folder_id": "root-id"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let about = client.get_about().await.unwrap();

    assert_eq!(about.largest_change_id, 42);
    assert_eq!(about.quota_bytes_total, 1024);
    assert_eq!(about.quota_bytes_used, 256);
    assert_eq!(about.root_folder_id, "root-id");
}

#[tokio::test]
async fn list_changes_parses_entries_and_next_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/changes"))
        .and(query_param("start_change_id", "6"))
        .and(query_param("max_results", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": "dir-a",
                    "change_stamp": 6,
                    "parents": ["root-id"],
                    "title": "A",
                    "type": "dir"
                },
                {
                    "id": "file-b",
                    "change_stamp": 7,
                    "parents": ["dir-a"],
                    "title": "B.txt",
                    "type": "file",
                    "md5": "abc",
                    "modified": "2024-01-01T00:00:00Z"
                }
            ],
            "next_page_token": "page-2"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token")
        .unwrap()
        .with_page_size(2);
    let page = client.list_changes(6, None).await.unwrap();

    assert_eq!(page.next_page_token.as_deref(), Some("page-2"));
    assert_eq!(page.entries.len(), 2);
    assert!(page.entries[0].is_directory);
    assert!(page.entries[0].parent_ids.contains("root-id"));
    let file = &page.entries[1];
    assert!(!file.is_directory);
    assert!(!file.deleted);
    assert_eq!(file.content_hash.as_deref(), Some("abc"));
    assert_eq!(file.modified, Some(1_704_067_200));
}

#[tokio::test]
async fn list_changes_forwards_page_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/changes"))
        .and(query_param("page_token", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "id": "gone", "change_stamp": 9, "deleted": true }
            ]
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let page = client.list_changes(0, Some("page-2")).await.unwrap();

    assert!(page.next_page_token.is_none());
    assert_eq!(page.entries.len(), 1);
    assert!(page.entries[0].deleted);
}

#[tokio::test]
async fn empty_next_page_token_ends_pagination() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [],
            "next_page_token": ""
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let page = client.list_changes(0, None).await.unwrap();

    assert!(page.next_page_token.is_none());
}

#[tokio::test]
async fn directory_children_are_fetched_through_the_service_trait() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("parent_id", "dir-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": "file-b",
                    "change_stamp": 3,
                    "parents": ["dir-a"],
                    "title": "B.txt",
                    "type": "file"
                }
            ]
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let service: &dyn DriveService = &client;
    let page = service.fetch_directory_children("dir-a", None).await.unwrap();

    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].title, "B.txt");
}

#[tokio::test]
async fn api_errors_are_classified() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/about"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/changes"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();

    let err = client.get_about().await.unwrap_err();
    assert!(matches!(err, DriveError::Api { ref body, .. } if body == "expired"));
    assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
    assert!(!err.is_retryable());

    let err = client.list_changes(0, None).await.unwrap_err();
    assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn slow_responses_surface_as_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/about"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(2))
                .set_body_json(json!({
                    "largest_change_id": 1,
                    "quota_bytes_total": 1,
                    "quota_bytes_used": 0,
                    "root_folder_id": "root-id"
                })),
        )
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token")
        .unwrap()
        .with_request_timeout(Duration::from_millis(100))
        .unwrap();
    let err = client.get_about().await.unwrap_err();

    assert!(matches!(err, DriveError::Timeout));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn invalid_modified_time_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": "file-b",
                    "change_stamp": 3,
                    "title": "B.txt",
                    "modified": "yesterday"
                }
            ]
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.list_children("dir-a", None).await.unwrap_err();

    assert!(matches!(err, DriveError::Time(_)));
}
