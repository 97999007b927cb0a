use rfm_github::{ActionsApi, HttpActionsApi, RunnerScope};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api_for(server: &MockServer) -> HttpActionsApi {
    HttpActionsApi::with_base_url(server.uri(), "test-token".into())
        .expect("client builds")
}

#[tokio::test]
async fn lists_workflow_runs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/actions/runs"))
        .and(query_param("per_page", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({
                "total_count": 2,
                "workflow_runs": [
                    {"id": 11, "status": "queued"},
                    {"id": 12, "status": "completed"}
                ]
            }),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    let runs = api.list_workflow_runs("acme", "widgets").await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, Some(11));
    assert_eq!(runs[0].status.as_deref(), Some("queued"));
}

#[tokio::test]
async fn lists_jobs_for_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/actions/runs/11/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({
                "total_count": 2,
                "jobs": [
                    {"id": 1, "status": "in_progress"},
                    {"id": 2, "status": "queued"}
                ]
            }),
        ))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let jobs = api.list_workflow_jobs("acme", "widgets", 11).await.unwrap();
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
async fn repository_discovery_filters_archived_and_disabled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orgs/acme/repos"))
        .and(query_param("sort", "pushed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!([
                {"name": "live", "archived": false, "disabled": false},
                {"name": "old", "archived": true, "disabled": false},
                {"name": "off", "archived": false, "disabled": true}
            ]),
        ))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let repos = api.list_repositories("acme").await.unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].name, "live");
}

#[tokio::test]
async fn runner_listing_and_removal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orgs/acme/actions/runners"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({
                "total_count": 1,
                "runners": [{"id": 7, "name": "pool-abc", "busy": false}]
            }),
        ))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/orgs/acme/actions/runners/7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    let scope = RunnerScope::Organization("acme".into());
    let runners = api.list_runners(&scope).await.unwrap();
    assert_eq!(runners.len(), 1);
    assert!(!runners[0].busy);
    api.remove_runner(&scope, 7).await.unwrap();
}

#[tokio::test]
async fn api_error_status_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/actions/runs"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let err = api.list_workflow_runs("acme", "widgets").await.unwrap_err();
    assert!(matches!(err, rfm_github::GithubError::Api(s) if s.as_u16() == 403));
}
