//! ═══════════════════════════════════════════════════════════════════
//! REST API 통합 테스트
//! ═══════════════════════════════════════════════════════════════════
//!
//! Axum 라우터를 `oneshot`으로 직접 호출해 전체 apply 왕복을 검증합니다:
//!
//! 1. **인스턴스 목록**: 빈 목록, 마스터만 노출
//! 2. **라우팅**: 알 수 없는 경로/메서드는 404 "not found"
//! 3. **apply 왕복**: 쓰기 → 발행 → 검증 플러그인 응답 → 200
//! 4. **실패 매핑**: 타임아웃 408, 허용 밖 경로 403, 잘못된 폼 400
//! 5. **상관관계**: 동시 요청이 서로의 응답을 받지 않음
//!
//! 모든 테스트는 `tempdir`을 사용해 파일시스템을 격리합니다.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tower::ServiceExt;

use nginx_agent::binary::{generate_nginx_id, BinaryInspector};
use nginx_agent::bus::{
    ApplyConfigResponse, ApplyStatus, Message, MessageBus, Payload, Publisher, Topic,
};
use nginx_agent::environment::Environment;
use nginx_agent::plugin::{NginxValidator, Plugin, PluginError, PluginInfo, ValidatorSettings};
use nginx_agent::process_monitor::{Process, StaticProcessSource};
use nginx_agent::rest::{self, RequestBridge};

const BOUNDARY: &str = "nginx-agent-test-boundary";
const FAKE_BINARY: &str = "/nonexistent/sbin/nginx";

// ═══════════════════════════════════════════════════════
// 테스트 유틸리티
// ═══════════════════════════════════════════════════════

fn master(pid: u32, conf: &Path) -> Process {
    Process {
        pid,
        ppid: Some(1),
        name: "nginx".to_string(),
        path: None,
        cmd: vec![format!("nginx: master process {} -c {}", FAKE_BINARY, conf.display())],
        is_master: true,
        start_time: 1_700_000_000,
    }
}

fn worker(pid: u32, parent: u32) -> Process {
    Process {
        pid,
        ppid: Some(parent),
        name: "nginx".to_string(),
        path: None,
        cmd: vec!["nginx: worker process".to_string()],
        is_master: false,
        start_time: 1_700_000_001,
    }
}

/// `file` 필드 하나를 담은 multipart/form-data 본문
fn multipart_body(field: &str, contents: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"nginx.conf\"\r\n",
            field
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn put_config(path: &str, field: &str, contents: &[u8]) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri(path)
        .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(Body::from(multipart_body(field, contents)))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), 1024 * 64).await.unwrap().to_vec()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

/// 받은 설정 내용을 그대로 메시지로 돌려주는 응답 플러그인.
/// `ignoring`으로 지정한 설정 경로에는 응답하지 않습니다.
struct EchoPlugin {
    publisher: OnceLock<Publisher>,
    ignore: Option<PathBuf>,
}

impl EchoPlugin {
    fn new() -> Self {
        Self {
            publisher: OnceLock::new(),
            ignore: None,
        }
    }

    fn ignoring(path: &Path) -> Self {
        Self {
            publisher: OnceLock::new(),
            ignore: Some(path.to_path_buf()),
        }
    }
}

impl Plugin for EchoPlugin {
    fn init(&self, publisher: Publisher) -> anyhow::Result<()> {
        self.publisher
            .set(publisher)
            .map_err(|_| anyhow::anyhow!("echo already initialized"))
    }

    fn process(&self, message: &Message) -> Result<(), PluginError> {
        let Payload::ApplyConfig(request) = message.payload() else {
            return Err(PluginError::UnexpectedPayload(message.topic()));
        };
        let publisher = self.publisher.get().ok_or(PluginError::NotInitialized)?;
        if self.ignore.as_deref() == Some(request.config_path.as_path()) {
            return Ok(());
        }
        let echoed = String::from_utf8_lossy(&request.contents).to_string();
        publisher.publish(Message::apply_config_response(ApplyConfigResponse::for_request(
            request,
            ApplyStatus::Ok,
            echoed,
        )))?;
        Ok(())
    }

    fn subscriptions(&self) -> Vec<Topic> {
        vec![Topic::NginxConfigApply]
    }

    fn info(&self) -> PluginInfo {
        PluginInfo::new("echo", "test")
    }

    fn close(&self) {}
}

enum Responder {
    Validator,
    Echo,
    Silent,
}

struct Harness {
    app: Router,
    bus: MessageBus,
    dir: TempDir,
}

impl Harness {
    fn conf_path(&self) -> PathBuf {
        self.dir.path().join("nginx.conf")
    }
}

/// 임시 디렉터리 안의 `nginx.conf`를 가리키는 마스터 하나로 에이전트를 구성합니다.
fn harness(responder: Responder, timeout: Duration, with_master: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("nginx.conf");
    std::fs::write(&conf, "events {}\n").unwrap();

    let processes = if with_master {
        vec![master(100, &conf), worker(101, 100), worker(102, 100)]
    } else {
        Vec::new()
    };
    let responder: Option<Arc<dyn Plugin>> = match responder {
        Responder::Validator => Some(Arc::new(NginxValidator::new(ValidatorSettings {
            run_binary: false,
            ..ValidatorSettings::default()
        }))),
        Responder::Echo => Some(Arc::new(EchoPlugin::new())),
        Responder::Silent => None,
    };
    let (app, bus) = agent(processes, vec![dir.path().to_path_buf()], responder, timeout);

    Harness { app, bus, dir }
}

/// 임의의 프로세스 목록/허용 디렉터리/응답 플러그인으로 라우터와 버스를 구성합니다.
fn agent(
    processes: Vec<Process>,
    allowed: Vec<PathBuf>,
    responder: Option<Arc<dyn Plugin>>,
    timeout: Duration,
) -> (Router, MessageBus) {
    let env = Arc::new(Environment::new(
        Arc::new(StaticProcessSource::new(processes)),
        "test-host",
        allowed,
    ));
    let bridge = Arc::new(RequestBridge::new(env, BinaryInspector::default(), timeout));

    let bus = MessageBus::new();
    bus.register(bridge.clone()).unwrap();
    if let Some(plugin) = responder {
        bus.register(plugin).unwrap();
    }
    bus.start().unwrap();

    (rest::router(bridge), bus)
}

fn instance_id(conf: &Path) -> String {
    generate_nginx_id(Some(Path::new(FAKE_BINARY)), conf, None)
}

// ═══════════════════════════════════════════════════════
// GET /nginx
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_list_without_instances_is_empty_array() {
    let h = harness(Responder::Validator, Duration::from_secs(5), false);

    let resp = h.app.clone().oneshot(get("/nginx")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, serde_json::json!([]));
    h.bus.close();
}

#[tokio::test]
async fn test_list_reports_only_masters() {
    let h = harness(Responder::Validator, Duration::from_secs(5), true);

    for path in ["/nginx", "/nginx/"] {
        let resp = h.app.clone().oneshot(get(path)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let list = json.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["process_id"], 100);
        assert_eq!(list[0]["is_master"], true);
        assert_eq!(list[0]["conf_path"], h.conf_path().display().to_string());
    }
    h.bus.close();
}

// ═══════════════════════════════════════════════════════
// 라우팅
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_unknown_routes_are_not_found() {
    let h = harness(Responder::Validator, Duration::from_secs(5), true);

    let resp = h.app.clone().oneshot(get("/other")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_bytes(resp).await, b"not found");

    // 경로는 맞지만 메서드가 다른 경우
    let req = Request::builder()
        .method(Method::POST)
        .uri("/nginx")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_bytes(resp).await, b"not found");

    let resp = h.app.clone().oneshot(get("/nginx/config")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    h.bus.close();
}

// ═══════════════════════════════════════════════════════
// PUT /nginx/config
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_apply_writes_file_and_returns_validator_response() {
    let h = harness(Responder::Validator, Duration::from_secs(5), true);
    let contents = b"events{}\n\n";
    assert_eq!(contents.len(), 10);

    let resp = h
        .app
        .clone()
        .oneshot(put_config("/nginx/config", "file", contents))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/json");

    let json = body_json(resp).await;
    let results = json.as_array().unwrap();
    assert_eq!(results.len(), 1);

    assert_eq!(results[0]["nginx_id"], instance_id(&h.conf_path()));
    assert_eq!(results[0]["status"], "ok");
    assert_eq!(results[0]["system_id"], "test-host");
    assert_eq!(std::fs::read(h.conf_path()).unwrap(), contents);
    h.bus.close();
}

#[tokio::test]
async fn test_invalid_config_is_reported_in_ok_body() {
    let h = harness(Responder::Validator, Duration::from_secs(5), true);

    let resp = h
        .app
        .clone()
        .oneshot(put_config("/nginx/config/", "file", b"http {\n"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json[0]["status"], "error");
    let message = json[0]["message"].as_str().unwrap();
    assert!(message.contains("unclosed"));
    assert!(message.contains("previous config restored"));

    // 거부된 설정은 디스크에 남지 않아야 함
    assert_eq!(std::fs::read(h.conf_path()).unwrap(), b"events {}\n");
    h.bus.close();
}

#[tokio::test]
async fn test_empty_upload_does_not_truncate_config() {
    let h = harness(Responder::Validator, Duration::from_secs(5), true);

    let resp = h
        .app
        .clone()
        .oneshot(put_config("/nginx/config", "file", b""))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json[0]["status"], "error");
    assert!(json[0]["message"].as_str().unwrap().contains("config is empty"));
    assert_eq!(std::fs::read(h.conf_path()).unwrap(), b"events {}\n");
    h.bus.close();
}

#[tokio::test]
async fn test_apply_without_instances_returns_empty_results() {
    let h = harness(Responder::Validator, Duration::from_secs(5), false);

    let resp = h
        .app
        .clone()
        .oneshot(put_config("/nginx/config", "file", b"events {}\n"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, serde_json::json!([]));
    // 원래 파일은 그대로
    assert_eq!(std::fs::read_to_string(h.conf_path()).unwrap(), "events {}\n");
    h.bus.close();
}

#[tokio::test]
async fn test_missing_file_field_is_bad_request() {
    let h = harness(Responder::Validator, Duration::from_secs(5), true);

    let resp = h
        .app
        .clone()
        .oneshot(put_config("/nginx/config", "upload", b"events {}\n"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "MALFORMED_REQUEST");

    // multipart가 아닌 본문
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/nginx/config")
        .header("content-type", "text/plain")
        .body(Body::from("events {}"))
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(std::fs::read_to_string(h.conf_path()).unwrap(), "events {}\n");
    h.bus.close();
}

#[tokio::test]
async fn test_silent_bus_times_out_with_408() {
    let timeout = Duration::from_millis(200);
    let h = harness(Responder::Silent, timeout, true);

    let started = Instant::now();
    let resp = h
        .app
        .clone()
        .oneshot(put_config("/nginx/config", "file", b"events {}\n"))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(2), "took {:?}", elapsed);

    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "TIMEOUT");
    assert_eq!(json["results"], serde_json::json!([]));
    assert_eq!(json["nginx_id"], instance_id(&h.conf_path()));
    // 응답이 없었으므로 원본으로 되돌려져 있어야 함
    assert_eq!(std::fs::read(h.conf_path()).unwrap(), b"events {}\n");
    h.bus.close();
}

#[tokio::test]
async fn test_config_outside_allowed_directories_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("allowed")).unwrap();
    let outside = dir.path().join("outside");
    std::fs::create_dir(&outside).unwrap();
    let conf = outside.join("nginx.conf");
    std::fs::write(&conf, "events {}\n").unwrap();

    // <tmp>/allowed만 허용, 설정 파일은 <tmp>/outside 아래
    let (app, bus) = agent(
        vec![master(200, &conf)],
        vec![dir.path().join("allowed")],
        Some(Arc::new(EchoPlugin::new())),
        Duration::from_secs(5),
    );

    let resp = app
        .oneshot(put_config("/nginx/config", "file", b"http { }\n"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "PATH_NOT_ALLOWED");
    assert_eq!(std::fs::read_to_string(&conf).unwrap(), "events {}\n");
    bus.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_get_their_own_responses() {
    let h = harness(Responder::Echo, Duration::from_secs(10), true);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let app = h.app.clone();
        tasks.push(tokio::spawn(async move {
            let contents = format!("events {{}} # request {}\n", i);
            let resp = app
                .oneshot(put_config("/nginx/config", "file", contents.as_bytes()))
                .await
                .unwrap();
            (contents, resp.status(), body_json(resp).await)
        }));
    }

    for task in tasks {
        let (contents, status, json) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["message"], contents);
    }

    // 마지막 쓰기가 온전한 한 요청의 내용이어야 함 (섞이지 않음)
    let final_contents = std::fs::read_to_string(h.conf_path()).unwrap();
    assert!(final_contents.starts_with("events {} # request "));
    assert_eq!(final_contents.lines().count(), 1);
    h.bus.close();
}

#[tokio::test]
async fn test_repeated_apply_is_idempotent() {
    let h = harness(Responder::Validator, Duration::from_secs(5), true);
    let contents = b"events {}\nhttp { server { listen 8080; } }\n";

    let mut ids = Vec::new();
    for _ in 0..2 {
        let resp = h
            .app
            .clone()
            .oneshot(put_config("/nginx/config", "file", contents))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json[0]["status"], "ok");
        ids.push(json[0]["nginx_id"].clone());
        assert_eq!(std::fs::read(h.conf_path()).unwrap(), contents);
    }
    assert_eq!(ids[0], ids[1]);
    h.bus.close();
}

// ═══════════════════════════════════════════════════════
// 여러 인스턴스
// ═══════════════════════════════════════════════════════

/// `<tmp>/a/nginx.conf`, `<tmp>/b/nginx.conf` 두 설정 파일
fn two_confs(dir: &Path) -> (PathBuf, PathBuf) {
    let a = dir.join("a").join("nginx.conf");
    let b = dir.join("b").join("nginx.conf");
    for conf in [&a, &b] {
        std::fs::create_dir_all(conf.parent().unwrap()).unwrap();
        std::fs::write(conf, "events {}\n").unwrap();
    }
    (a, b)
}

#[tokio::test]
async fn test_second_instance_failure_keeps_first_result() {
    let dir = tempfile::tempdir().unwrap();
    let (conf_a, conf_b) = two_confs(dir.path());

    // b는 허용 디렉터리 밖
    let (app, bus) = agent(
        vec![master(100, &conf_a), master(200, &conf_b)],
        vec![dir.path().join("a")],
        Some(Arc::new(EchoPlugin::new())),
        Duration::from_secs(5),
    );

    let resp = app
        .oneshot(put_config("/nginx/config", "file", b"http { }\n"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "PATH_NOT_ALLOWED");
    assert_eq!(json["nginx_id"], instance_id(&conf_b));
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["nginx_id"], instance_id(&conf_a));
    assert_eq!(results[0]["config_path"], conf_a.display().to_string());

    assert_eq!(std::fs::read_to_string(&conf_a).unwrap(), "http { }\n");
    assert_eq!(std::fs::read_to_string(&conf_b).unwrap(), "events {}\n");
    bus.close();
}

#[tokio::test]
async fn test_second_instance_timeout_restores_only_that_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (conf_a, conf_b) = two_confs(dir.path());
    let timeout = Duration::from_millis(300);

    let (app, bus) = agent(
        vec![master(100, &conf_a), master(200, &conf_b)],
        vec![dir.path().to_path_buf()],
        Some(Arc::new(EchoPlugin::ignoring(&conf_b))),
        timeout,
    );

    let started = Instant::now();
    let resp = app
        .oneshot(put_config("/nginx/config", "file", b"http { }\n"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(started.elapsed() < timeout + Duration::from_secs(2));

    let json = body_json(resp).await;
    assert_eq!(json["nginx_id"], instance_id(&conf_b));
    assert_eq!(json["results"][0]["nginx_id"], instance_id(&conf_a));
    assert_eq!(json["results"].as_array().unwrap().len(), 1);

    // a는 확정, b는 원본으로 복구
    assert_eq!(std::fs::read_to_string(&conf_a).unwrap(), "http { }\n");
    assert_eq!(std::fs::read_to_string(&conf_b).unwrap(), "events {}\n");
    bus.close();
}

#[tokio::test]
async fn test_write_failure_maps_to_io_error_and_keeps_original() {
    let dir = tempfile::tempdir().unwrap();
    // 설정 파일의 부모가 디렉터리가 아닌 일반 파일
    let blocker = dir.path().join("conf");
    std::fs::write(&blocker, "not a directory\n").unwrap();
    let conf = blocker.join("nginx.conf");

    let (app, bus) = agent(
        vec![master(100, &conf)],
        vec![dir.path().to_path_buf()],
        Some(Arc::new(EchoPlugin::new())),
        Duration::from_secs(5),
    );

    let resp = app
        .oneshot(put_config("/nginx/config", "file", b"events {}\n"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "IO_ERROR");
    assert_eq!(json["nginx_id"], instance_id(&conf));
    assert_eq!(std::fs::read(&blocker).unwrap(), b"not a directory\n");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    bus.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_across_instances_stay_correlated() {
    let dir = tempfile::tempdir().unwrap();
    let (conf_a, conf_b) = two_confs(dir.path());

    let (app, bus) = agent(
        vec![master(100, &conf_a), worker(101, 100), master(200, &conf_b)],
        vec![dir.path().to_path_buf()],
        Some(Arc::new(EchoPlugin::new())),
        Duration::from_secs(10),
    );

    let mut tasks = Vec::new();
    for i in 0..6 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let contents = format!("events {{}} # request {}\n", i);
            let resp = app
                .oneshot(put_config("/nginx/config", "file", contents.as_bytes()))
                .await
                .unwrap();
            (contents, resp.status(), body_json(resp).await)
        }));
    }

    for task in tasks {
        let (contents, status, json) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let results = json.as_array().unwrap();
        assert_eq!(results.len(), 2);
        // 인스턴스 순서대로, 각 응답은 자기 요청의 내용만 담고 있어야 함
        assert_eq!(results[0]["nginx_id"], instance_id(&conf_a));
        assert_eq!(results[1]["nginx_id"], instance_id(&conf_b));
        assert_eq!(results[0]["message"], contents);
        assert_eq!(results[1]["message"], contents);
    }

    for conf in [&conf_a, &conf_b] {
        let final_contents = std::fs::read_to_string(conf).unwrap();
        assert!(final_contents.starts_with("events {} # request "));
        assert_eq!(final_contents.lines().count(), 1);
    }
    bus.close();
}
