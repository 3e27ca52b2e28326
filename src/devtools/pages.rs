//! Page listing from a devtools HTTP endpoint.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

// ============================================================================
// Constants
// ============================================================================

/// Timeout for the `/json/list` request.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// PageInfo
// ============================================================================

/// One entry of `GET /json/list`, as reported by the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Target id.
    #[serde(default)]
    pub id: Option<String>,
    /// Page title.
    #[serde(default)]
    pub title: Option<String>,
    /// Page URL.
    #[serde(default)]
    pub url: Option<String>,
    /// WebSocket URL to send commands to; absent while another client is
    /// attached.
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

impl PageInfo {
    /// Returns `true` for pages loaded over `http://` or `https://`.
    #[must_use]
    pub fn is_web_page(&self) -> bool {
        self.url
            .as_deref()
            .is_some_and(|url| url.starts_with("http://") || url.starts_with("https://"))
    }
}

// ============================================================================
// TargetPage
// ============================================================================

/// An injectable page, tagged with the process that hosts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPage {
    /// Process id of the hosting web view.
    pub pid: u32,
    /// Process name, from its command line.
    pub process_name: String,
    /// Devtools target id.
    pub page_id: String,
    /// Page title.
    pub title: String,
    /// Page URL.
    pub url: String,
}

impl TargetPage {
    /// Builds a target from a listed page; `None` unless it is an
    /// `http(s)` page with an id.
    #[must_use]
    pub fn from_page(pid: u32, process_name: &str, page: &PageInfo) -> Option<Self> {
        if !page.is_web_page() {
            return None;
        }
        Some(Self {
            pid,
            process_name: process_name.to_string(),
            page_id: page.id.clone()?,
            title: page.title.clone().unwrap_or_default(),
            url: page.url.clone().unwrap_or_default(),
        })
    }
}

// ============================================================================
// Listing
// ============================================================================

/// Fetches `http://{addr}/json/list`.
///
/// # Errors
///
/// [`Error::Http`](crate::Error::Http) on connection failure, timeout, a
/// non-success status, or a malformed body.
pub async fn list_pages(addr: SocketAddr) -> Result<Vec<PageInfo>> {
    let client = reqwest::Client::builder()
        .timeout(LIST_TIMEOUT)
        .no_proxy()
        .build()?;

    let pages: Vec<PageInfo> = client
        .get(format!("http://{addr}/json/list"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    debug!(%addr, count = pages.len(), "Listed devtools pages");
    Ok(pages)
}

/// Lists the injectable pages of process `pid` behind `addr`.
///
/// # Errors
///
/// See [`list_pages`].
pub async fn list_targets(addr: SocketAddr, pid: u32, process_name: &str) -> Result<Vec<TargetPage>> {
    let pages = list_pages(addr).await?;
    Ok(pages
        .iter()
        .filter_map(|page| TargetPage::from_page(pid, process_name, page))
        .collect())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::devtools::testing::FakeDevtools;

    fn sample() -> serde_json::Value {
        json!([
            {
                "description": "",
                "id": "A1",
                "title": "Shop",
                "type": "page",
                "url": "https://shop.example/",
                "webSocketDebuggerUrl": "ws://127.0.0.1/devtools/page/A1"
            },
            {
                "id": "B2",
                "title": "blank",
                "type": "page",
                "url": "about:blank",
                "webSocketDebuggerUrl": "ws://127.0.0.1/devtools/page/B2"
            },
            {
                "id": "C3",
                "type": "page",
                "url": "http://intranet/"
            },
            {
                "title": "no id",
                "url": "https://example.com/"
            }
        ])
    }

    #[test]
    fn test_deserialize_page_list() {
        let pages: Vec<PageInfo> = serde_json::from_value(sample()).unwrap();

        assert_eq!(pages.len(), 4);
        assert_eq!(pages[0].id.as_deref(), Some("A1"));
        assert_eq!(
            pages[0].web_socket_debugger_url.as_deref(),
            Some("ws://127.0.0.1/devtools/page/A1")
        );
        assert!(pages[2].web_socket_debugger_url.is_none());
        assert!(pages[2].title.is_none());
    }

    #[test]
    fn test_only_web_pages_with_ids_are_targets() {
        let pages: Vec<PageInfo> = serde_json::from_value(sample()).unwrap();
        let targets: Vec<_> = pages
            .iter()
            .filter_map(|p| TargetPage::from_page(42, "com.example.app", p))
            .collect();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].page_id, "A1");
        assert_eq!(targets[0].title, "Shop");
        assert_eq!(targets[1].page_id, "C3");
        assert_eq!(targets[1].title, "");
        assert!(targets.iter().all(|t| t.pid == 42));
    }

    #[tokio::test]
    async fn test_list_targets_over_http() {
        let server = FakeDevtools::start(sample()).await;

        let targets = list_targets(server.addr(), 7, "com.example.app")
            .await
            .expect("list");

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].process_name, "com.example.app");
    }

    #[tokio::test]
    async fn test_list_pages_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = list_pages(addr).await.unwrap_err();
        assert!(matches!(err, crate::Error::Http(_)));
    }
}
