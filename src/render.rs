use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ScrapeError;

const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Renders a page in a scriptable browser context and returns the markup
/// after a marker element appears. Used only for fragments populated by
/// client-side script after initial load.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        url: &str,
        wait_selector: &str,
        timeout: Duration,
    ) -> Result<String, ScrapeError>;
}

/// Headless-Chrome renderer. The browser sits behind a mutex, so renders
/// are serialized: a single session cannot safely serve two symbols at once.
pub struct ChromeRenderer {
    browser: tokio::sync::Mutex<Browser>,
}

impl ChromeRenderer {
    pub async fn launch() -> Result<Self, ScrapeError> {
        let config = BrowserConfig::builder()
            .build()
            .map_err(ScrapeError::Render)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::Render(e.to_string()))?;

        // The handler stream must be drained for the CDP connection to make
        // progress; it ends when the browser goes away.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler: {}", e);
                }
            }
        });

        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
        })
    }

    /// Close the browser process. Callable through a shared handle once the
    /// run is over; pending renders finish first because they hold the lock.
    pub async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!("browser close failed: {}", e);
        }
        let _ = browser.wait().await;
    }
}

async fn wait_and_capture(
    page: &Page,
    url: &str,
    wait_selector: &str,
    timeout: Duration,
) -> Result<String, ScrapeError> {
    page.wait_for_navigation()
        .await
        .map_err(|e| ScrapeError::Render(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    while page.find_element(wait_selector).await.is_err() {
        if Instant::now() >= deadline {
            return Err(ScrapeError::RenderTimeout {
                url: url.to_string(),
                selector: wait_selector.to_string(),
            });
        }
        tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
    }

    page.content()
        .await
        .map_err(|e| ScrapeError::Render(e.to_string()))
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(
        &self,
        url: &str,
        wait_selector: &str,
        timeout: Duration,
    ) -> Result<String, ScrapeError> {
        let browser = self.browser.lock().await;
        let page = browser
            .new_page(url)
            .await
            .map_err(|e| ScrapeError::Render(e.to_string()))?;

        // Capture first, then close on every exit path, including timeout.
        let result = wait_and_capture(&page, url, wait_selector, timeout).await;
        if let Err(e) = page.close().await {
            warn!("page close failed for {}: {}", url, e);
        }
        result
    }
}
