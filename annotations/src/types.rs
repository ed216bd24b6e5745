//! Annotation entities and their wire shapes.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorConfidence {
    Stable,
    Fragile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementRect {
    /// A rect worth screenshotting: finite with positive area.
    pub fn is_capturable(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width > 0.0
            && self.height > 0.0
    }
}

/// Source-map info reported by the overlay for framework components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub selector: String,
    pub selector_confidence: SelectorConfidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<ElementRect>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: Uuid,
    pub url: String,
    pub selector: String,
    pub selector_confidence: SelectorConfidence,
    pub text: String,
    pub status: AnnotationStatus,
    pub viewport: Viewport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_info: Option<ComponentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_data_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<ElementDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_point: Option<AnchorPoint>,
    pub created_at_iso: String,
    pub updated_at_iso: String,
}

impl Annotation {
    pub fn is_open(&self) -> bool {
        self.status == AnnotationStatus::Open
    }
}
