//! Dashboard annotation payloads
//!
//! Wire format for the Grafana-compatible `api/annotations` endpoint. A
//! creation request carries `time`, an update carries `timeEnd`; the two are
//! never sent together.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<i64>,

    /// Start timestamp, milliseconds since UNIX epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,

    /// End timestamp, milliseconds since UNIX epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<u64>,

    pub tags: Vec<String>,

    pub text: String,
}

impl Annotation {
    /// Annotation marking the start of a session
    pub fn starting(text: impl Into<String>, start_ms: u64, tags: Vec<String>) -> Self {
        Self {
            dashboard_id: None,
            panel_id: None,
            time: Some(start_ms),
            time_end: None,
            tags,
            text: text.into(),
        }
    }

    /// Annotation update closing a session with a link to its report
    pub fn finished(url: &str, end_ms: u64, tags: Vec<String>) -> Self {
        Self {
            dashboard_id: None,
            panel_id: None,
            time: None,
            time_end: Some(end_ms),
            tags,
            text: link_html(url),
        }
    }

    /// Annotation update closing a session that produced no report
    pub fn closed(text: impl Into<String>, end_ms: u64, tags: Vec<String>) -> Self {
        Self {
            dashboard_id: None,
            panel_id: None,
            time: None,
            time_end: Some(end_ms),
            tags,
            text: text.into(),
        }
    }
}

/// Response body of an annotation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationResponse {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub message: String,
}

fn link_html(url: &str) -> String {
    format!("<a href=\"{url}\" target=\"_blank\">{url}</a>")
}
