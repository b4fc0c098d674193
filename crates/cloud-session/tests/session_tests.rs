use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use cloud_session::{CloudConfig, CloudError, CloudSession};

#[derive(Default)]
struct FakeCloud {
    logins: AtomicUsize,
    status_calls: AtomicUsize,
    login_delay_ms: u64,
    login_forms: Mutex<Vec<HashMap<String, String>>>,
    login_replies: Mutex<VecDeque<Value>>,
    status_replies: Mutex<VecDeque<(StatusCode, Value)>>,
    tokens_seen: Mutex<Vec<String>>,
}

impl FakeCloud {
    fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn script_status(&self, status: StatusCode, body: Value) {
        self.status_replies.lock().unwrap().push_back((status, body));
    }

    fn script_login(&self, body: Value) {
        self.login_replies.lock().unwrap().push_back(body);
    }
}

async fn login(
    State(cloud): State<Arc<FakeCloud>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    let n = cloud.logins.fetch_add(1, Ordering::SeqCst) + 1;
    cloud.login_forms.lock().unwrap().push(form);
    if cloud.login_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cloud.login_delay_ms)).await;
    }
    let scripted = cloud.login_replies.lock().unwrap().pop_front();
    Json(scripted.unwrap_or_else(|| json!({ "token": format!("token-{n}"), "expires_in": 3600 })))
}

async fn status(
    State(cloud): State<Arc<FakeCloud>>,
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    cloud.status_calls.fetch_add(1, Ordering::SeqCst);
    cloud
        .tokens_seen
        .lock()
        .unwrap()
        .push(query.get("token").cloned().unwrap_or_default());
    let scripted = cloud.status_replies.lock().unwrap().pop_front();
    let (code, body) = scripted.unwrap_or_else(|| {
        (
            StatusCode::OK,
            json!({
                "code": 1,
                "msg": "success",
                "data": [
                    { "devid": "0123abcd", "name": "Venus", "soc": 64, "charge": 300 },
                    { "devid": "4567ef01", "name": "Garage", "soc": "22" }
                ]
            }),
        )
    });
    (code, Json(body))
}

async fn spawn_cloud(cloud: FakeCloud) -> (Arc<FakeCloud>, CloudConfig) {
    let cloud = Arc::new(cloud);
    let app = Router::new()
        .route("/login", post(login))
        .route("/status", get(status))
        .route("/broken", get(|| async { "<html>not json</html>" }))
        .with_state(cloud.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake cloud");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let config = CloudConfig {
        base_url: format!("http://{addr}"),
        login_path: "/login".to_string(),
        status_path: "/status".to_string(),
        mailbox: "owner@example.com".to_string(),
        password_hash: "5f4dcc3b5aa765d61d8327deb882cf99".to_string(),
        freshness_ms: 30_000,
        request_timeout_ms: 2_000,
    };
    (cloud, config)
}

#[tokio::test]
async fn login_posts_credentials_and_keeps_token() {
    let (cloud, config) = spawn_cloud(FakeCloud::default()).await;
    let session = CloudSession::new(config).expect("client");

    let token = session.login().await.expect("login");
    assert_eq!(token.token, "token-1");
    assert!(token.expires_at.is_some());
    assert!(session.has_token());

    let forms = cloud.login_forms.lock().unwrap().clone();
    assert_eq!(forms[0]["mailbox"], "owner@example.com");
    assert_eq!(forms[0]["pwd"], "5f4dcc3b5aa765d61d8327deb882cf99");
}

#[tokio::test]
async fn concurrent_logins_share_one_request() {
    let (cloud, config) = spawn_cloud(FakeCloud {
        login_delay_ms: 150,
        ..FakeCloud::default()
    })
    .await;
    let session = CloudSession::new(config).expect("client");

    let (a, b) = tokio::join!(session.login(), session.login());
    assert_eq!(a.expect("first").token, "token-1");
    assert_eq!(b.expect("second").token, "token-1");
    assert_eq!(cloud.logins(), 1);

    session.login().await.expect("later login");
    assert_eq!(cloud.logins(), 2);
}

#[tokio::test]
async fn missing_token_is_an_auth_error() {
    let cloud = FakeCloud::default();
    cloud.script_login(json!({ "code": 0, "msg": "wrong password" }));
    let (_cloud, config) = spawn_cloud(cloud).await;
    let session = CloudSession::new(config).expect("client");

    let err = session.login().await.expect_err("no token");
    assert!(err.is_auth(), "{err:?}");
    assert!(err.to_string().contains("wrong password"));
    assert!(!session.has_token());
}

#[tokio::test]
async fn fresh_snapshot_is_served_from_cache() {
    let (cloud, config) = spawn_cloud(FakeCloud::default()).await;
    let session = CloudSession::new(config).expect("client");

    let first = session.fetch_status().await.expect("status");
    let second = session.fetch_status().await.expect("status");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cloud.status_calls(), 1);
    assert_eq!(cloud.logins(), 1);
    assert_eq!(first.devices.len(), 2);
    let garage = first.device("4567ef01").expect("device");
    assert_eq!(garage.number("soc"), Some(22.0));
    assert_eq!(cloud.tokens_seen.lock().unwrap().clone(), vec!["token-1".to_string()]);
}

#[tokio::test]
async fn stale_snapshot_is_refetched_without_new_login() {
    let (cloud, mut config) = spawn_cloud(FakeCloud::default()).await;
    config.freshness_ms = 0;
    let session = CloudSession::new(config).expect("client");

    session.fetch_status().await.expect("status");
    session.fetch_status().await.expect("status");
    assert_eq!(cloud.status_calls(), 2);
    assert_eq!(cloud.logins(), 1);
}

#[tokio::test]
async fn concurrent_fetches_during_login_share_everything() {
    let (cloud, config) = spawn_cloud(FakeCloud {
        login_delay_ms: 150,
        ..FakeCloud::default()
    })
    .await;
    let session = CloudSession::new(config).expect("client");

    let (a, b) = tokio::join!(session.fetch_status(), session.fetch_status());
    let (a, b) = (a.expect("first"), b.expect("second"));
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cloud.logins(), 1);
    assert_eq!(cloud.status_calls(), 1);
}

#[tokio::test]
async fn unauthorized_status_triggers_one_relogin() {
    let cloud = FakeCloud::default();
    cloud.script_status(StatusCode::UNAUTHORIZED, json!({ "msg": "expired" }));
    let (cloud, config) = spawn_cloud(cloud).await;
    let session = CloudSession::new(config).expect("client");

    let snapshot = session.fetch_status().await.expect("status after relogin");
    assert_eq!(snapshot.devices.len(), 2);
    assert_eq!(cloud.logins(), 2);
    assert_eq!(cloud.status_calls(), 2);
    assert_eq!(
        cloud.tokens_seen.lock().unwrap().clone(),
        vec!["token-1".to_string(), "token-2".to_string()]
    );
}

#[tokio::test]
async fn envelope_token_message_triggers_relogin() {
    let cloud = FakeCloud::default();
    cloud.script_status(StatusCode::OK, json!({ "code": 8, "msg": "Token is invalid" }));
    cloud.script_status(
        StatusCode::OK,
        json!({ "code": 1, "data": { "devid": "0123abcd", "soc": 80 } }),
    );
    let (cloud, config) = spawn_cloud(cloud).await;
    let session = CloudSession::new(config).expect("client");

    let snapshot = session.fetch_status().await.expect("status");
    assert_eq!(snapshot.devices.len(), 1);
    assert_eq!(snapshot.devices[0].number("soc"), Some(80.0));
    assert_eq!(cloud.logins(), 2);
}

#[tokio::test]
async fn persistent_token_rejection_retries_exactly_once() {
    let cloud = FakeCloud::default();
    cloud.script_status(StatusCode::FORBIDDEN, json!({ "msg": "token expired" }));
    cloud.script_status(StatusCode::FORBIDDEN, json!({ "msg": "token expired" }));
    cloud.script_status(StatusCode::FORBIDDEN, json!({ "msg": "token expired" }));
    let (cloud, config) = spawn_cloud(cloud).await;
    let session = CloudSession::new(config).expect("client");

    let err = session.fetch_status().await.expect_err("rejected");
    assert!(err.is_auth(), "{err:?}");
    assert_eq!(cloud.status_calls(), 2);
    assert_eq!(cloud.logins(), 2);
    assert!(session.cached().is_none());
}

#[tokio::test]
async fn server_error_surfaces_without_retry() {
    let cloud = FakeCloud::default();
    cloud.script_status(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "msg": "maintenance window" }),
    );
    let (cloud, config) = spawn_cloud(cloud).await;
    let session = CloudSession::new(config).expect("client");

    match session.fetch_status().await {
        Err(CloudError::Status { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "maintenance window");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(cloud.status_calls(), 1);
    assert_eq!(cloud.logins(), 1);
}

#[tokio::test]
async fn non_token_api_failure_is_reported() {
    let cloud = FakeCloud::default();
    cloud.script_status(StatusCode::OK, json!({ "code": 5, "msg": "rate limited" }));
    let (cloud, config) = spawn_cloud(cloud).await;
    let session = CloudSession::new(config).expect("client");

    let err = session.fetch_status().await.expect_err("api error");
    assert!(matches!(err, CloudError::Api { code: Some(5), .. }), "{err:?}");
    assert_eq!(cloud.logins(), 1);
}

#[tokio::test]
async fn malformed_body_is_reported() {
    let (_cloud, mut config) = spawn_cloud(FakeCloud::default()).await;
    config.status_path = "/broken".to_string();
    let session = CloudSession::new(config).expect("client");

    let err = session.fetch_status().await.expect_err("malformed");
    assert!(matches!(err, CloudError::Malformed(_)), "{err:?}");
}

#[tokio::test]
async fn unreachable_cloud_is_an_http_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let session = CloudSession::new(CloudConfig {
        base_url: format!("http://{addr}"),
        request_timeout_ms: 1_000,
        ..CloudConfig::default()
    })
    .expect("client");
    let err = session.login().await.expect_err("unreachable");
    assert!(matches!(err, CloudError::Http(_)), "{err:?}");
}

#[tokio::test]
async fn invalidate_forces_new_login() {
    let (cloud, config) = spawn_cloud(FakeCloud::default()).await;
    let session = CloudSession::new(config).expect("client");

    session.fetch_status().await.expect("status");
    session.invalidate();
    assert!(!session.has_token());
    assert!(session.cached().is_none());

    session.fetch_status().await.expect("status");
    assert_eq!(cloud.logins(), 2);
    assert_eq!(cloud.status_calls(), 2);
}

#[tokio::test]
async fn unrepresentable_expiry_is_treated_as_no_expiry() {
    let cloud = FakeCloud::default();
    cloud.script_login(json!({ "token": "long-lived", "expires_in": u64::MAX }));
    let (cloud, config) = spawn_cloud(cloud).await;
    let session = CloudSession::new(config).expect("client");

    let token = session.login().await.expect("login");
    assert_eq!(token.token, "long-lived");
    assert!(token.expires_at.is_none());

    let snapshot = session.fetch_status().await.expect("status");
    assert_eq!(snapshot.devices.len(), 2);
    session.fetch_status().await.expect("cached status");
    assert_eq!(cloud.logins(), 1);
    assert_eq!(cloud.tokens_seen.lock().unwrap().as_slice(), ["long-lived"]);
}
