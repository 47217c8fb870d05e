use thiserror::Error;

/// Failures the scrape core can produce. Transport variants are recoverable
/// per symbol; `Config` and `Collision` indicate a bad fragment set and are
/// surfaced before any pipeline starts.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("request to {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("render of {url} timed out waiting for '{selector}'")]
    RenderTimeout { url: String, selector: String },
    #[error("browser error: {0}")]
    Render(String),
    #[error("no renderer configured for rendered fetch profile")]
    RendererUnavailable,
    #[error("fragment configuration error: {0}")]
    Config(String),
    #[error("fragment '{name}' produced twice with different content")]
    Collision { name: String },
}

impl ScrapeError {
    /// Transport failures are the retryable class; everything else is either
    /// a configuration problem or a data problem retrying cannot fix.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ScrapeError::HttpStatus { .. }
                | ScrapeError::Network { .. }
                | ScrapeError::RenderTimeout { .. }
                | ScrapeError::Render(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        let status = ScrapeError::HttpStatus {
            url: "https://example.com".into(),
            status: 503,
        };
        assert!(status.is_transport());
        let timeout = ScrapeError::RenderTimeout {
            url: "https://example.com".into(),
            selector: "#peers".into(),
        };
        assert!(timeout.is_transport());
        assert!(!ScrapeError::Config("dup".into()).is_transport());
        assert!(!ScrapeError::Collision { name: "x".into() }.is_transport());
    }
}
