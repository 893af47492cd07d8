//! Ona fetcher and raw mirroring against a mock server

mod common;

use chrono::Utc;
use common::{init_test_tracing, MemorySink};
use formsync_ingest::fetch::{record_stream, OnaConfig, OnaFetcher, RemoteFetcher};
use formsync_ingest::{Pipeline, RunStatus, UnitStatus};
use futures::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ona(server: &MockServer, page_size: Option<u32>) -> OnaFetcher {
    init_test_tracing();
    let mut config = OnaConfig::new(server.uri(), "secret-token");
    config.page_size = page_size;
    OnaFetcher::new(config).unwrap()
}

#[tokio::test]
async fn test_fetch_sends_token_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/1234"))
        .and(header("Authorization", "Token secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "_id": 1, "name": "Amina" },
            { "_id": 2, "name": "Juma" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let batch = ona(&server, None).fetch("1234", None).await.unwrap();

    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.records[1]["name"], json!("Juma"));
    assert!(batch.next.is_none());
}

#[tokio::test]
async fn test_stream_follows_pages_until_short_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/1234"))
        .and(query_param("page", "1"))
        .and(query_param("page_size", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "_id": 1 }, { "_id": 2 }])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/1234"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "_id": 3 }])))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher: Arc<dyn RemoteFetcher> = Arc::new(ona(&server, Some(2)));
    let records: Vec<_> = record_stream(fetcher, "1234".to_string()).try_collect().await.unwrap();

    let ids: Vec<_> = records.iter().map(|r| r["_id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_not_found_past_last_page_ends_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/1234"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "_id": 1 }, { "_id": 2 }])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/1234"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "detail": "Invalid page." })))
        .mount(&server)
        .await;

    let fetcher: Arc<dyn RemoteFetcher> = Arc::new(ona(&server, Some(2)));
    let records: Vec<_> = record_stream(fetcher, "1234".to_string()).try_collect().await.unwrap();

    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_stream_ends_when_server_ignores_paging() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/1234"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "_id": 1 }, { "_id": 2 }])))
        .expect(2)
        .mount(&server)
        .await;

    let fetcher: Arc<dyn RemoteFetcher> = Arc::new(ona(&server, Some(2)));
    let records: Vec<_> = record_stream(fetcher, "1234".to_string()).try_collect().await.unwrap();

    let ids: Vec<_> = records.iter().map(|r| r["_id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_not_found_on_first_page_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/999"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = ona(&server, Some(2)).fetch("999", None).await.unwrap_err();
    assert_eq!(err.form_id, "999");
}

#[tokio::test]
async fn test_list_projects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .and(header("Authorization", "Token secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "projectid": 7,
                "name": "Registrations",
                "forms": [ { "formid": 1234, "name": "household_reg" }, null ]
            },
            { "projectid": 8, "name": "Empty" }
        ])))
        .mount(&server)
        .await;

    let projects = ona(&server, None).list_projects().await.unwrap();

    assert_eq!(projects.len(), 2);
    assert_eq!(projects[0].forms.iter().flatten().count(), 1);
    assert!(projects[1].forms.is_empty());
}

#[tokio::test]
async fn test_mirror_copies_every_form() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "projectid": 7,
                "name": "Registrations",
                "forms": [
                    { "formid": 1234, "name": "household_reg" },
                    { "formid": 1235, "name": "followup" }
                ]
            }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/1234"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "_id": 1, "members": [{ "name": "Amina" }] },
            { "_id": 2 },
            { "name": "no id" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/1235"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let pipeline = Pipeline::mirror("ona", Arc::new(ona(&server, None)), Arc::clone(&sink) as _);
    let summary = pipeline.run(Utc::now()).await;

    assert_eq!(summary.source, "ona");
    assert_eq!(summary.forms.len(), 2);

    let reg = &summary.forms[0];
    assert_eq!(reg.target, "household_reg");
    assert_eq!(reg.counts.fetched, 3);
    assert_eq!(reg.counts.upserted, 2);
    assert_eq!(reg.counts.failed, 1);
    assert_eq!(summary.forms[1].status, UnitStatus::NoData);

    let documents = sink.documents("household_reg");
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0]["members"][0]["name"], json!("Amina"));

    // one document could not be keyed
    assert_eq!(summary.status, RunStatus::PartialFailure);
}

#[tokio::test]
async fn test_mirror_fails_when_projects_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let summary = Pipeline::mirror("ona", Arc::new(ona(&server, None)), Arc::clone(&sink) as _)
        .run(Utc::now())
        .await;

    assert_eq!(summary.status, RunStatus::Failure);
    assert_eq!(summary.forms[0].form_id, "projects");
    assert_eq!(sink.calls(), 0);
}
