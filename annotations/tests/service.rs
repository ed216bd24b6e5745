//! End-to-end tests for the annotation HTTP service over real sockets.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use pagebridge_annotations::AnnotationService;
use serde_json::Value;
use serde_json::json;

async fn start_service(base_port: u16) -> (Arc<AnnotationService>, String) {
    let service = AnnotationService::new(base_port);
    let port = service.start().await.expect("service should bind");
    (service, format!("http://127.0.0.1:{port}"))
}

fn minimal_annotation(text: &str) -> Value {
    json!({
        "url": "http://localhost:3000/",
        "selector": "#app",
        "text": text,
        "viewport": {"width": 800, "height": 600},
    })
}

#[tokio::test]
async fn health_route_reports_count_and_port() {
    let (service, base) = start_service(19230).await;
    let body: Value = reqwest::get(format!("{base}/"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["count"], 0);
    assert_eq!(body["port"], 19230);
    service.shutdown().await;
}

#[tokio::test]
async fn create_cap_returns_429_and_recovers_after_delete() {
    let (service, base) = start_service(19240).await;
    let client = reqwest::Client::new();

    let mut first_id = None;
    for i in 0..50 {
        let resp = client
            .post(format!("{base}/annotations"))
            .json(&minimal_annotation(&format!("ann-{i}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201, "annotation {i}");
        let body: Value = resp.json().await.unwrap();
        first_id.get_or_insert(body["id"].as_str().unwrap().to_string());
    }

    let over = client
        .post(format!("{base}/annotations"))
        .json(&minimal_annotation("ann-50"))
        .send()
        .await
        .unwrap();
    assert_eq!(over.status(), 429);

    let deleted = client
        .delete(format!("{base}/annotations/{}", first_id.unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let retry = client
        .post(format!("{base}/annotations"))
        .json(&minimal_annotation("after delete"))
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status(), 201);
    service.shutdown().await;
}

#[tokio::test]
async fn send_with_no_waiter_latches_and_consume_is_one_shot() {
    let (service, base) = start_service(19250).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/annotations/send"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let start = Instant::now();
    assert!(service.wait_for_send(5_000).await);
    assert!(start.elapsed() < Duration::from_millis(200));

    assert!(service.consume_sent_state().await);
    assert!(!service.consume_sent_state().await);
    service.shutdown().await;
}

#[tokio::test]
async fn wait_for_send_times_out_without_a_send() {
    let (service, _base) = start_service(19260).await;
    let start = Instant::now();
    assert!(!service.wait_for_send(50).await);
    assert!(start.elapsed() >= Duration::from_millis(45));
    service.shutdown().await;
}

#[tokio::test]
async fn oversized_text_is_rejected_on_create_and_patch() {
    let (service, base) = start_service(19270).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/annotations"))
        .json(&minimal_annotation(&"x".repeat(10 * 1024 + 1)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Text exceeds"));

    let created: Value = client
        .post(format!("{base}/annotations"))
        .json(&minimal_annotation("ok"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let patch = client
        .patch(format!("{base}/annotations/{id}"))
        .json(&json!({"text": "y".repeat(10 * 1024 + 1)}))
        .send()
        .await
        .unwrap();
    assert_eq!(patch.status(), 400);
    let body: Value = patch.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Text exceeds"));
    service.shutdown().await;
}

#[tokio::test]
async fn viewport_bounds_are_rejected() {
    let (service, base) = start_service(19280).await;
    let client = reqwest::Client::new();

    for viewport in [
        json!({"width": -1, "height": 600}),
        json!({"width": 200000, "height": 600}),
    ] {
        let mut body = minimal_annotation("t");
        body["viewport"] = viewport.clone();
        let resp = client
            .post(format!("{base}/annotations"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "viewport: {viewport}");
    }
    service.shutdown().await;
}

#[tokio::test]
async fn multi_element_annotation_round_trips() {
    let (service, base) = start_service(19290).await;
    let client = reqwest::Client::new();

    let mut body = minimal_annotation("two elements");
    body["elements"] = json!([
        {"selector": ".a", "rect": {"x": 1, "y": 2, "width": 3, "height": 4}},
        {"selector": ".b"},
    ]);
    body["anchorPoint"] = json!({"x": 50, "y": 50});

    let resp = client
        .post(format!("{base}/annotations"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let listed: Value = client
        .get(format!("{base}/annotations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let annotations = listed.as_array().unwrap();
    assert_eq!(annotations.len(), 1);
    let annotation = &annotations[0];
    assert_eq!(annotation["elements"].as_array().unwrap().len(), 2);
    assert_eq!(annotation["anchorPoint"], json!({"x": 50.0, "y": 50.0}));
    assert_eq!(annotation["status"], "open");
    assert_eq!(annotation["selectorConfidence"], "fragile");
    service.shutdown().await;
}

#[tokio::test]
async fn resolve_transitions_and_bulk_delete() {
    let (service, base) = start_service(19300).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/annotations"))
        .json(&minimal_annotation("to resolve"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap();

    let resolved: Value = client
        .post(format!("{base}/annotations/{id}/resolve"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["status"], "resolved");
    assert!(
        resolved["createdAtIso"].as_str().unwrap()
            <= resolved["updatedAtIso"].as_str().unwrap()
    );

    let uuid = uuid::Uuid::parse_str(id).unwrap();
    let entity = service.annotation(uuid).await.unwrap();
    assert!(!entity.is_open());

    client
        .post(format!("{base}/annotations"))
        .json(&minimal_annotation("another"))
        .send()
        .await
        .unwrap();

    let cleared: Value = client
        .delete(format!("{base}/annotations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["success"], true);
    assert_eq!(cleared["deleted"], 2);
    service.shutdown().await;
}

#[tokio::test]
async fn unknown_ids_and_routes_return_404() {
    let (service, base) = start_service(19310).await;
    let client = reqwest::Client::new();

    let missing = client
        .delete(format!(
            "{base}/annotations/00000000-0000-4000-8000-000000000000"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let not_a_uuid = client
        .delete(format!("{base}/annotations/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(not_a_uuid.status(), 404);

    let unknown = client.get(format!("{base}/nope")).send().await.unwrap();
    assert_eq!(unknown.status(), 404);
    let body: Value = unknown.json().await.unwrap();
    assert!(body["error"].is_string());
    service.shutdown().await;
}

#[tokio::test]
async fn cors_echoes_loopback_origins_and_falls_back_otherwise() {
    let (service, base) = start_service(19320).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/annotations"))
        .header("Origin", "http://localhost:5173")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()["access-control-allow-origin"],
        "http://localhost:5173"
    );
    assert_eq!(resp.headers()["vary"], "Origin");

    let resp = client
        .get(format!("{base}/annotations"))
        .header("Origin", "https://evil.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()["access-control-allow-origin"],
        "http://localhost"
    );

    let preflight = client
        .request(reqwest::Method::OPTIONS, format!("{base}/annotations"))
        .header("Origin", "http://localhost:5173")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), 204);
    let methods = preflight.headers()["access-control-allow-methods"]
        .to_str()
        .unwrap();
    for method in ["GET", "POST", "PATCH", "DELETE", "OPTIONS"] {
        assert!(methods.contains(method));
    }
    assert_eq!(
        preflight.headers()["access-control-allow-headers"],
        "Content-Type"
    );
    service.shutdown().await;
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let (service, base) = start_service(19330).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/annotations"))
        .header("Content-Type", "application/json")
        .body("x".repeat(64 * 1024 + 1))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    service.shutdown().await;
}

#[tokio::test]
async fn bind_conflict_probes_consecutive_ports() {
    let (first, _) = start_service(19340).await;
    let (second, base) = start_service(19340).await;
    assert!(base.ends_with(":19341"));
    first.shutdown().await;
    second.shutdown().await;
}
