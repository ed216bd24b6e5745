//! Page-target listing and selection.
//!
//! Targets are always re-read from the browser's HTTP inspection endpoint;
//! WebSocket URLs are never cached across connects.

use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::BrowserError;
use crate::Result;

/// One navigable target as reported by the inspection endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTarget {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
}

impl PageTarget {
    pub fn is_page(&self) -> bool {
        self.kind == "page"
    }
}

const INTERNAL_PREFIXES: &[&str] = &["devtools://", "chrome://", "chrome-extension://", "about:"];

pub fn is_internal_url(url: &str) -> bool {
    INTERNAL_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_loopback_http(url: &str) -> bool {
    if !is_http_url(url) {
        return false;
    }
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(is_loopback_host))
        .unwrap_or(false)
}

/// Pick the target a developer most likely wants: a loopback http(s) page,
/// then any http(s) page, then anything that is not browser-internal, then
/// whatever is first.
pub fn choose_default_target(targets: &[PageTarget]) -> Option<&PageTarget> {
    let pages: Vec<&PageTarget> = targets.iter().filter(|t| t.is_page()).collect();
    let external: Vec<&PageTarget> = pages
        .iter()
        .copied()
        .filter(|t| !is_internal_url(&t.url))
        .collect();

    external
        .iter()
        .copied()
        .find(|t| is_loopback_http(&t.url))
        .or_else(|| external.iter().copied().find(|t| is_http_url(&t.url)))
        .or_else(|| external.first().copied())
        .or_else(|| pages.first().copied())
}

/// Match by case-insensitive URL substring, applying the default preference
/// order among the matches.
pub fn choose_matching_target<'a>(
    targets: &'a [PageTarget],
    url_pattern: &str,
) -> Option<&'a PageTarget> {
    let needle = url_pattern.to_lowercase();
    let matches: Vec<PageTarget> = targets
        .iter()
        .filter(|t| t.is_page() && t.url.to_lowercase().contains(&needle))
        .cloned()
        .collect();
    let chosen = choose_default_target(&matches)?;
    targets
        .iter()
        .find(|t| t.id == chosen.id)
}

/// Fetch the target list over the HTTP inspection endpoint.
pub async fn list_targets(host: &str, port: u16) -> Result<Vec<PageTarget>> {
    let url = format!("http://{host}:{port}/json/list");
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(|e| BrowserError::Unreachable(e.to_string()))?;
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| BrowserError::Unreachable(format!("failed to list targets: {e}")))?;
    if !resp.status().is_success() {
        return Err(BrowserError::Unreachable(format!(
            "{url} returned {}",
            resp.status()
        )));
    }
    let targets: Vec<PageTarget> = resp
        .json()
        .await
        .map_err(|e| BrowserError::Unreachable(format!("bad target listing: {e}")))?;
    Ok(targets)
}

/// Fetch the browser-level WebSocket URL from `/json/version`.
pub async fn discover_ws_url(host: &str, port: u16) -> Result<String> {
    #[derive(Deserialize)]
    struct JsonVersion {
        #[serde(rename = "webSocketDebuggerUrl")]
        web_socket_debugger_url: String,
    }

    let url = format!("http://{host}:{port}/json/version");
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(|e| BrowserError::Unreachable(e.to_string()))?;
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| BrowserError::Unreachable(format!("debug port not reachable: {e}")))?;
    if !resp.status().is_success() {
        return Err(BrowserError::Unreachable(format!(
            "{url} returned {}",
            resp.status()
        )));
    }
    let body: JsonVersion = resp
        .json()
        .await
        .map_err(|e| BrowserError::Unreachable(format!("bad version response: {e}")))?;
    Ok(body.web_socket_debugger_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn target(id: &str, url: &str) -> PageTarget {
        PageTarget {
            id: id.to_string(),
            title: String::new(),
            kind: "page".to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn prefers_loopback_http_over_external() {
        let targets = vec![
            target("a", "devtools://devtools/bundled/devtools_app.html"),
            target("b", "https://example.com/"),
            target("c", "http://localhost:3000/app"),
        ];
        let chosen = choose_default_target(&targets).unwrap();
        assert_eq!(chosen.id, "c");
    }

    #[test]
    fn falls_back_to_any_http_then_non_internal() {
        let targets = vec![
            target("a", "chrome://newtab/"),
            target("b", "https://example.com/"),
        ];
        assert_eq!(choose_default_target(&targets).unwrap().id, "b");

        let targets = vec![
            target("a", "chrome://newtab/"),
            target("b", "file:///home/dev/index.html"),
        ];
        assert_eq!(choose_default_target(&targets).unwrap().id, "b");
    }

    #[test]
    fn only_internal_targets_selects_the_first() {
        let targets = vec![
            target("a", "chrome://newtab/"),
            target("b", "about:blank"),
        ];
        assert_eq!(choose_default_target(&targets).unwrap().id, "a");
    }

    #[test]
    fn non_page_targets_are_never_selected() {
        let mut worker = target("w", "http://localhost:9000/");
        worker.kind = "service_worker".to_string();
        let targets = vec![worker, target("p", "https://example.com/")];
        assert_eq!(choose_default_target(&targets).unwrap().id, "p");
    }

    #[test]
    fn empty_list_selects_nothing() {
        assert!(choose_default_target(&[]).is_none());
    }

    #[test]
    fn pattern_match_is_case_insensitive_substring() {
        let targets = vec![
            target("a", "https://example.com/"),
            target("b", "http://localhost:5173/Admin/Panel"),
        ];
        let chosen = choose_matching_target(&targets, "admin").unwrap();
        assert_eq!(chosen.id, "b");
        assert!(choose_matching_target(&targets, "missing").is_none());
    }

    #[test]
    fn pattern_matches_prefer_loopback() {
        let targets = vec![
            target("a", "https://app.example.com/dash"),
            target("b", "http://127.0.0.1:3000/dash"),
        ];
        assert_eq!(choose_matching_target(&targets, "dash").unwrap().id, "b");
    }

    #[test]
    fn ipv6_loopback_counts_as_loopback() {
        let targets = vec![
            target("a", "https://example.com/"),
            target("b", "http://[::1]:8080/"),
        ];
        assert_eq!(choose_default_target(&targets).unwrap().id, "b");
    }

    #[test]
    fn internal_prefixes_are_recognized() {
        assert!(is_internal_url("devtools://devtools/x"));
        assert!(is_internal_url("chrome://settings"));
        assert!(is_internal_url("chrome-extension://abc/bg.html"));
        assert!(is_internal_url("about:blank"));
        assert!(!is_internal_url("http://localhost/about:blank"));
    }
}
