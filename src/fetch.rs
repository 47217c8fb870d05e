use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ScrapeError;
use crate::render::Renderer;

/// How a page's markup is obtained. Most fragments live in the static
/// HTML; the peer-comparison table is populated client-side and needs a
/// rendered fetch that waits for a marker element.
#[derive(Debug, Clone)]
pub enum FetchProfile {
    Static,
    Rendered {
        wait_selector: String,
        timeout: Duration,
    },
}

/// Source of raw markup for a symbol. Abstracted so the orchestrator can be
/// driven by an in-memory fake in tests. No retry at this layer.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, symbol: &str, profile: &FetchProfile) -> Result<String, ScrapeError>;
}

/// Production source: plain reqwest GET for the static profile, a browser
/// renderer for the rendered profile.
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
    renderer: Option<Arc<dyn Renderer>>,
}

impl HttpPageSource {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        renderer: Option<Arc<dyn Renderer>>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            renderer,
        }
    }

    /// Deterministic URL template per symbol. The rendered leg targets the
    /// consolidated view, matching where the peer table is populated.
    pub fn url_for(&self, symbol: &str, profile: &FetchProfile) -> String {
        match profile {
            FetchProfile::Static => format!("{}/company/{}/", self.base_url, symbol),
            FetchProfile::Rendered { .. } => {
                format!("{}/company/{}/consolidated/", self.base_url, symbol)
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, symbol: &str, profile: &FetchProfile) -> Result<String, ScrapeError> {
        let url = self.url_for(symbol, profile);
        match profile {
            FetchProfile::Static => {
                let resp = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| ScrapeError::Network {
                        url: url.clone(),
                        source: e,
                    })?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(ScrapeError::HttpStatus {
                        url,
                        status: status.as_u16(),
                    });
                }
                resp.text().await.map_err(|e| ScrapeError::Network {
                    url: url.clone(),
                    source: e,
                })
            }
            FetchProfile::Rendered {
                wait_selector,
                timeout,
            } => {
                let renderer = self
                    .renderer
                    .as_ref()
                    .ok_or(ScrapeError::RendererUnavailable)?;
                renderer.render(&url, wait_selector, *timeout).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_is_deterministic() {
        let source = HttpPageSource::new(
            reqwest::Client::new(),
            "https://www.screener.in/",
            None,
        );
        assert_eq!(
            source.url_for("TCS", &FetchProfile::Static),
            "https://www.screener.in/company/TCS/"
        );
        assert_eq!(
            source.url_for(
                "TCS",
                &FetchProfile::Rendered {
                    wait_selector: "#peers".into(),
                    timeout: Duration::from_secs(10),
                }
            ),
            "https://www.screener.in/company/TCS/consolidated/"
        );
    }

    #[tokio::test]
    async fn rendered_profile_without_renderer_errors() {
        let source = HttpPageSource::new(reqwest::Client::new(), "https://example.com", None);
        let err = source
            .fetch(
                "TCS",
                &FetchProfile::Rendered {
                    wait_selector: "#peers".into(),
                    timeout: Duration::from_secs(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::RendererUnavailable));
    }
}
