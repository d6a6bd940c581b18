//! HTTP API tests, driving the router in-process.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use hiera_audit::api::{ApiState, build_router};
use hiera_audit::hierarchy::HierarchyEntry;
use hiera_audit::service::Auditor;
use hiera_audit::sources::{StaticFacts, YamlDataDir};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApi {
    _dir: TempDir,
    auditor: Arc<Auditor>,
    router: Router,
}

fn setup() -> TestApi {
    let dir = TempDir::new().unwrap();
    let root = dir.path().display().to_string();
    std::fs::create_dir_all(dir.path().join("nodes")).unwrap();
    std::fs::write(dir.path().join("nodes/web01.yaml"), "ntp::servers: [a]\nmotd: node\n").unwrap();
    std::fs::write(dir.path().join("common.yaml"), "ntp::servers: [a]\nmotd: hi\n").unwrap();

    let facts = StaticFacts::new().with("web01", &[("certname", "web01")]);
    let (usage, results) = Auditor::memory_stores();
    let auditor = Arc::new(Auditor::new(
        root,
        vec![
            HierarchyEntry::Single("nodes/%{::certname}".into()),
            HierarchyEntry::Single("common".into()),
        ],
        Arc::new(YamlDataDir::new()),
        Arc::new(facts),
        usage,
        results,
    ));
    let router = build_router(ApiState::new(Arc::clone(&auditor)), true);
    TestApi {
        _dir: dir,
        auditor,
        router,
    }
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

mod read_routes {
    use super::*;

    #[tokio::test]
    async fn health() {
        let api = setup();
        let (status, body) = call(&api.router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn hierarchy_templates_and_resolved() {
        let api = setup();
        let (status, body) = call(&api.router, Method::GET, "/v1/hierarchy", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["vars"], json!(["certname"]));
        assert!(body["paths"][0].as_str().unwrap().ends_with("nodes/%{::certname}.yaml"));

        let (status, body) = call(&api.router, Method::GET, "/v1/hierarchy/web01", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"][0].as_str().unwrap().ends_with("nodes/web01.yaml"));
    }

    #[tokio::test]
    async fn unknown_certname_is_404() {
        let api = setup();
        let (status, body) = call(&api.router, Method::GET, "/v1/clean/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "IDENTITY_NOT_FOUND");
    }

    #[tokio::test]
    async fn lookup_found_and_missing() {
        let api = setup();
        let (status, body) = call(&api.router, Method::GET, "/v1/lookup/web01/motd", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], "node");
        assert_eq!(body["paths"].as_array().unwrap().len(), 2);

        let (status, body) = call(&api.router, Method::GET, "/v1/lookup/web01/absent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "KEY_NOT_FOUND");
    }
}

mod logging_routes {
    use super::*;

    #[tokio::test]
    async fn record_then_clean() {
        let api = setup();
        let (status, body) = call(
            &api.router,
            Method::POST,
            "/v1/logging",
            Some(json!({"certname": "web01", "key": "motd"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body[0]["certname"], "web01");
        assert_eq!(body[0]["key"], "motd");
        assert!(body[0]["date"].is_string());

        let (status, body) = call(&api.router, Method::GET, "/v1/logging/web01", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = call(&api.router, Method::GET, "/v1/clean/web01", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logged_and_in_hierarchy"][0]["key"], "motd");
        assert_eq!(body["in_hierarchy_not_logged"][0]["key"], "ntp::servers");
        assert_eq!(body["duplicates"][0]["key"], "ntp::servers");
    }

    #[tokio::test]
    async fn all_logs_listed() {
        let api = setup();
        let (status, body) = call(&api.router, Method::GET, "/v1/logging", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        for (certname, key) in [("web01", "motd"), ("db01", "ntp::servers"), ("web01", "ntp::servers")] {
            let (status, _) = call(
                &api.router,
                Method::POST,
                "/v1/logging",
                Some(json!({"certname": certname, "key": key})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = call(&api.router, Method::GET, "/v1/logging", None).await;
        assert_eq!(status, StatusCode::OK);
        let logs = body.as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["certname"], "db01");
        assert_eq!(logs[1]["certname"], "web01");
        assert_eq!(logs[1]["keys"].as_array().unwrap().len(), 2);
        assert_eq!(logs[1]["keys"][0]["key"], "motd");
    }

    #[tokio::test]
    async fn empty_key_rejected() {
        let api = setup();
        let (status, body) = call(
            &api.router,
            Method::POST,
            "/v1/logging",
            Some(json!({"certname": "web01", "key": " "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_FIELD_VALUE");
    }
}

mod estate_routes {
    use super::*;

    #[tokio::test]
    async fn report_missing_before_refresh() {
        let api = setup();
        let (status, body) = call(&api.router, Method::GET, "/v1/clean-all", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "REPORT_NOT_FOUND");
    }

    #[tokio::test]
    async fn refresh_publishes_report() {
        let api = setup();
        api.auditor.record_lookup("web01", "motd").unwrap();

        let (status, body) = call(&api.router, Method::POST, "/v1/clean-all/refresh", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);

        // The refresh runs in the background; wait for it to publish.
        let mut report = None;
        for _ in 0..100 {
            let (status, body) = call(&api.router, Method::GET, "/v1/clean-all", None).await;
            if status == StatusCode::OK {
                report = Some(body);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let report = report.expect("estate report published");
        assert_eq!(report["identities"], json!(["web01"]));
        assert_eq!(report["keys_never_used"][0]["key"], "ntp::servers");
    }
}
