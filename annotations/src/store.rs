//! In-memory annotation store with strict input validation.
//!
//! HTTP bodies arrive as untyped JSON; `CreateRequest::decode` and
//! `PatchRequest::decode` run every guard before anything touches the domain
//! types, so the store itself only ever sees valid data.

use std::collections::HashMap;

use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::AnnotationError;
use crate::Result;
use crate::types::AnchorPoint;
use crate::types::Annotation;
use crate::types::AnnotationStatus;
use crate::types::ComponentInfo;
use crate::types::ElementDescriptor;
use crate::types::ElementRect;
use crate::types::SelectorConfidence;
use crate::types::Viewport;

pub const MAX_ANNOTATIONS: usize = 50;
pub const MAX_TEXT_BYTES: usize = 10 * 1024;
pub const MAX_VIEWPORT_DIMENSION: f64 = 100_000.0;

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn confidence_from(raw: Option<&str>) -> SelectorConfidence {
    // Anything that is not explicitly "stable" is treated as fragile.
    match raw {
        Some("stable") => SelectorConfidence::Stable,
        _ => SelectorConfidence::Fragile,
    }
}

fn validate_text(text: &str) -> Result<()> {
    if text.len() > MAX_TEXT_BYTES {
        return Err(AnnotationError::BadRequest(format!(
            "Text exceeds {MAX_TEXT_BYTES} byte limit"
        )));
    }
    Ok(())
}

fn validate_viewport(viewport: &Viewport) -> Result<()> {
    for dim in [viewport.width, viewport.height] {
        if !dim.is_finite() || dim < 0.0 || dim > MAX_VIEWPORT_DIMENSION {
            return Err(AnnotationError::BadRequest(format!(
                "viewport dimensions must be between 0 and {MAX_VIEWPORT_DIMENSION}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawElement {
    selector: String,
    #[serde(default)]
    selector_confidence: Option<String>,
    #[serde(default)]
    rect: Option<ElementRect>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCreate {
    url: String,
    selector: String,
    #[serde(default)]
    selector_confidence: Option<String>,
    text: String,
    viewport: Viewport,
    #[serde(default)]
    react_source: Option<ComponentInfo>,
    #[serde(default)]
    element_rect: Option<ElementRect>,
    #[serde(default)]
    elements: Option<Vec<RawElement>>,
    #[serde(default)]
    anchor_point: Option<AnchorPoint>,
}

/// A fully validated creation request.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub url: String,
    pub selector: String,
    pub selector_confidence: SelectorConfidence,
    pub text: String,
    pub viewport: Viewport,
    pub component_info: Option<ComponentInfo>,
    pub element_rect: Option<ElementRect>,
    pub elements: Option<Vec<ElementDescriptor>>,
    pub anchor_point: Option<AnchorPoint>,
}

impl CreateRequest {
    pub fn decode(body: &Value) -> Result<Self> {
        let raw: RawCreate = serde_json::from_value(body.clone())
            .map_err(|e| AnnotationError::BadRequest(format!("malformed annotation: {e}")))?;
        validate_text(&raw.text)?;
        validate_viewport(&raw.viewport)?;

        let elements = raw.elements.map(|elements| {
            elements
                .into_iter()
                .map(|e| ElementDescriptor {
                    selector: e.selector,
                    selector_confidence: confidence_from(e.selector_confidence.as_deref()),
                    rect: e.rect,
                })
                .collect()
        });

        Ok(Self {
            url: raw.url,
            selector: raw.selector,
            selector_confidence: confidence_from(raw.selector_confidence.as_deref()),
            text: raw.text,
            viewport: raw.viewport,
            component_info: raw.react_source,
            element_rect: raw.element_rect,
            elements,
            anchor_point: raw.anchor_point,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawPatch {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub text: Option<String>,
}

impl PatchRequest {
    pub fn decode(body: &Value) -> Result<Self> {
        let raw: RawPatch = serde_json::from_value(body.clone())
            .map_err(|e| AnnotationError::BadRequest(format!("malformed patch: {e}")))?;
        if let Some(text) = &raw.text {
            validate_text(text)?;
        }
        Ok(Self { text: raw.text })
    }
}

/// Sole owner of the annotation map; every mutation goes through here.
pub struct AnnotationStore {
    annotations: Mutex<HashMap<Uuid, Annotation>>,
}

impl Default for AnnotationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self {
            annotations: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a validated annotation, enforcing the collection cap.
    /// `screenshot_data_url` is whatever the capture callback produced.
    pub async fn create(
        &self,
        request: CreateRequest,
        screenshot_data_url: Option<String>,
    ) -> Result<Annotation> {
        let mut annotations = self.annotations.lock().await;
        if annotations.len() >= MAX_ANNOTATIONS {
            return Err(AnnotationError::QuotaExceeded(MAX_ANNOTATIONS));
        }
        let now = now_iso();
        let annotation = Annotation {
            id: Uuid::new_v4(),
            url: request.url,
            selector: request.selector,
            selector_confidence: request.selector_confidence,
            text: request.text,
            status: AnnotationStatus::Open,
            viewport: request.viewport,
            component_info: request.component_info,
            screenshot_data_url,
            elements: request.elements,
            anchor_point: request.anchor_point,
            created_at_iso: now.clone(),
            updated_at_iso: now,
        };
        annotations.insert(annotation.id, annotation.clone());
        Ok(annotation)
    }

    pub async fn list(&self) -> Vec<Annotation> {
        let annotations = self.annotations.lock().await;
        let mut list: Vec<Annotation> = annotations.values().cloned().collect();
        list.sort_by(|a, b| a.created_at_iso.cmp(&b.created_at_iso));
        list
    }

    pub async fn open(&self) -> Vec<Annotation> {
        self.list().await.into_iter().filter(|a| a.is_open()).collect()
    }

    pub async fn open_count(&self) -> usize {
        let annotations = self.annotations.lock().await;
        annotations.values().filter(|a| a.is_open()).count()
    }

    pub async fn get(&self, id: Uuid) -> Option<Annotation> {
        self.annotations.lock().await.get(&id).cloned()
    }

    pub async fn patch(&self, id: Uuid, request: PatchRequest) -> Result<Annotation> {
        let mut annotations = self.annotations.lock().await;
        let annotation = annotations.get_mut(&id).ok_or(AnnotationError::NotFound)?;
        if let Some(text) = request.text {
            annotation.text = text;
        }
        annotation.updated_at_iso = now_iso();
        Ok(annotation.clone())
    }

    pub async fn resolve(&self, id: Uuid) -> Result<Annotation> {
        let mut annotations = self.annotations.lock().await;
        let annotation = annotations.get_mut(&id).ok_or(AnnotationError::NotFound)?;
        annotation.status = AnnotationStatus::Resolved;
        annotation.updated_at_iso = now_iso();
        Ok(annotation.clone())
    }

    pub async fn delete(&self, id: Uuid) -> bool {
        self.annotations.lock().await.remove(&id).is_some()
    }

    pub async fn clear(&self) -> usize {
        let mut annotations = self.annotations.lock().await;
        let deleted = annotations.len();
        annotations.clear();
        deleted
    }

    pub async fn len(&self) -> usize {
        self.annotations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.annotations.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn minimal_body(text: &str) -> Value {
        json!({
            "url": "http://localhost:3000/",
            "selector": "#app",
            "text": text,
            "viewport": {"width": 800.0, "height": 600.0},
        })
    }

    #[tokio::test]
    async fn create_and_list_round_trip() {
        let store = AnnotationStore::new();
        let request = CreateRequest::decode(&json!({
            "url": "http://localhost:3000/",
            "selector": ".card",
            "selectorConfidence": "stable",
            "text": "make this blue",
            "viewport": {"width": 1024.0, "height": 768.0},
            "reactSource": {"component": "Card", "source": "src/Card.tsx:12"},
            "anchorPoint": {"x": 50.0, "y": 60.0},
        }))
        .unwrap();
        let created = store.create(request, None).await.unwrap();

        let listed = store.list().await;
        assert_eq!(listed.len(), 1);
        let annotation = &listed[0];
        assert_eq!(annotation.id, created.id);
        assert_eq!(annotation.selector, ".card");
        assert_eq!(annotation.selector_confidence, SelectorConfidence::Stable);
        assert_eq!(annotation.status, AnnotationStatus::Open);
        assert_eq!(
            annotation.component_info.as_ref().map(|c| c.component.as_str()),
            Some("Card")
        );
        assert_eq!(annotation.anchor_point, Some(AnchorPoint { x: 50.0, y: 60.0 }));
        assert!(annotation.created_at_iso <= annotation.updated_at_iso);
    }

    #[tokio::test]
    async fn unknown_confidence_maps_to_fragile() {
        let request = CreateRequest::decode(&json!({
            "url": "http://localhost:3000/",
            "selector": "#x",
            "selectorConfidence": "very-sure",
            "text": "t",
            "viewport": {"width": 1.0, "height": 1.0},
        }))
        .unwrap();
        assert_eq!(request.selector_confidence, SelectorConfidence::Fragile);
    }

    #[tokio::test]
    async fn text_over_limit_is_rejected_with_marker_message() {
        let long = "x".repeat(MAX_TEXT_BYTES + 1);
        let err = CreateRequest::decode(&minimal_body(&long)).unwrap_err();
        let AnnotationError::BadRequest(message) = err else {
            panic!("expected BadRequest");
        };
        assert!(message.contains("Text exceeds"), "message: {message}");

        let patch_err = PatchRequest::decode(&json!({"text": long})).unwrap_err();
        let AnnotationError::BadRequest(message) = patch_err else {
            panic!("expected BadRequest");
        };
        assert!(message.contains("Text exceeds"));
    }

    #[tokio::test]
    async fn viewport_bounds_are_enforced() {
        for viewport in [
            json!({"width": -1.0, "height": 600.0}),
            json!({"width": 200_000.0, "height": 600.0}),
            json!({"width": 800.0, "height": f64::NAN}),
        ] {
            let mut body = minimal_body("t");
            body["viewport"] = viewport;
            // NaN does not survive JSON encoding; skip bodies that failed to build.
            if body["viewport"]["height"].is_null() {
                continue;
            }
            assert!(CreateRequest::decode(&body).is_err(), "body: {body}");
        }
    }

    #[tokio::test]
    async fn cap_is_enforced_and_recovers_after_delete() {
        let store = AnnotationStore::new();
        let mut first_id = None;
        for i in 0..MAX_ANNOTATIONS {
            let request = CreateRequest::decode(&minimal_body(&format!("ann-{i}"))).unwrap();
            let created = store.create(request, None).await.unwrap();
            first_id.get_or_insert(created.id);
        }

        let over = CreateRequest::decode(&minimal_body("one too many")).unwrap();
        assert!(matches!(
            store.create(over.clone(), None).await,
            Err(AnnotationError::QuotaExceeded(_))
        ));

        assert!(store.delete(first_id.unwrap()).await);
        assert!(store.create(over, None).await.is_ok());
    }

    #[tokio::test]
    async fn resolve_only_moves_open_to_resolved() {
        let store = AnnotationStore::new();
        let request = CreateRequest::decode(&minimal_body("t")).unwrap();
        let created = store.create(request, None).await.unwrap();

        let resolved = store.resolve(created.id).await.unwrap();
        assert_eq!(resolved.status, AnnotationStatus::Resolved);
        assert!(resolved.updated_at_iso >= resolved.created_at_iso);

        // Resolving again stays resolved.
        let again = store.resolve(created.id).await.unwrap();
        assert_eq!(again.status, AnnotationStatus::Resolved);
        assert!(again.updated_at_iso >= resolved.updated_at_iso);

        assert!(matches!(
            store.resolve(Uuid::new_v4()).await,
            Err(AnnotationError::NotFound)
        ));
    }

    #[tokio::test]
    async fn patch_updates_text_and_bumps_timestamp() {
        let store = AnnotationStore::new();
        let request = CreateRequest::decode(&minimal_body("before")).unwrap();
        let created = store.create(request, None).await.unwrap();

        let patched = store
            .patch(created.id, PatchRequest { text: Some("after".into()) })
            .await
            .unwrap();
        assert_eq!(patched.text, "after");
        assert!(patched.updated_at_iso >= created.updated_at_iso);
    }

    #[tokio::test]
    async fn multi_element_annotations_persist() {
        let store = AnnotationStore::new();
        let request = CreateRequest::decode(&json!({
            "url": "http://localhost:3000/",
            "selector": ".a",
            "text": "both of these",
            "viewport": {"width": 800.0, "height": 600.0},
            "elements": [
                {"selector": ".a", "rect": {"x": 0.0, "y": 0.0, "width": 10.0, "height": 10.0}},
                {"selector": ".b", "selectorConfidence": "stable"},
            ],
            "anchorPoint": {"x": 50.0, "y": 50.0},
        }))
        .unwrap();
        let created = store.create(request, None).await.unwrap();
        let elements = created.elements.unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1].selector_confidence, SelectorConfidence::Stable);
        assert_eq!(created.anchor_point, Some(AnchorPoint { x: 50.0, y: 50.0 }));
    }

    #[tokio::test]
    async fn clear_reports_how_many_were_deleted() {
        let store = AnnotationStore::new();
        for i in 0..3 {
            let request = CreateRequest::decode(&minimal_body(&format!("a{i}"))).unwrap();
            store.create(request, None).await.unwrap();
        }
        assert_eq!(store.clear().await, 3);
        assert!(store.is_empty().await);
    }
}
