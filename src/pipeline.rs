use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use scraper::Html;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ScrapeError;

use crate::db;
use crate::extract::FragmentSet;
use crate::fetch::{FetchProfile, PageSource};
use crate::merge::{merge_document, ScrapeResult};

/// Terminal state of one symbol's pipeline. Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
pub enum OutcomeStatus {
    Succeeded {
        document_id: String,
    },
    PartiallySucceeded {
        document_id: String,
        missing_fragments: Vec<String>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub symbol: String,
    pub status: OutcomeStatus,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self.status {
            OutcomeStatus::Succeeded { .. } => "ok",
            OutcomeStatus::PartiallySucceeded { .. } => "partial",
            OutcomeStatus::Failed { .. } => "failed",
        }
    }

    pub fn detail(&self) -> String {
        match &self.status {
            OutcomeStatus::Succeeded { document_id } => document_id.clone(),
            OutcomeStatus::PartiallySucceeded {
                document_id,
                missing_fragments,
            } => format!("{} (missing: {})", document_id, missing_fragments.join(", ")),
            OutcomeStatus::Failed { reason } => reason.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Max symbol pipelines in flight at any instant.
    pub concurrency: usize,
    /// Minimum spacing between consecutive pipeline starts.
    pub pacing: Duration,
    /// Dataset tag the documents are stored under.
    pub dataset: String,
    /// Stop issuing new pipeline starts after this long; in-flight symbols
    /// finish, never-started ones fail with a timeout reason.
    pub run_timeout: Option<Duration>,
    /// Max retries per leg fetch on transport-classed errors; an outcome is
    /// recorded on success or exhausted retries.
    pub max_retries: u32,
    /// Base backoff between retry attempts, doubled per attempt.
    pub retry_backoff: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            pacing: Duration::from_secs(1),
            dataset: "fundamentals".to_string(),
            run_timeout: None,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Normalize the inbound comma-separated symbol list: trim, uppercase,
/// drop empties. An empty result is a caller error, not a no-op run.
pub fn parse_symbol_list(raw: &str) -> Result<Vec<String>> {
    let symbols: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        bail!("no symbols provided");
    }
    Ok(symbols)
}

struct SymbolReport {
    index: usize,
    symbol: String,
    merged: Option<Value>,
    missing: Vec<String>,
    errors: Vec<String>,
}

/// Drive fetch → extract → merge → persist across all symbols under the
/// concurrency cap and pacing policy. Workers send merged documents over a
/// channel; this task owns the connection and performs every write, so no
/// partial document is ever persisted. Outcomes come back in submission
/// order regardless of completion order, one per requested symbol.
pub async fn run(
    conn: &Connection,
    source: Arc<dyn PageSource>,
    fragments: Arc<FragmentSet>,
    opts: &PipelineOptions,
    symbols: &[String],
) -> Result<Vec<Outcome>> {
    fragments.validate()?;
    if symbols.is_empty() {
        bail!("no symbols to scrape");
    }

    let total = symbols.len();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let start_gate = Arc::new(Mutex::new(Instant::now()));
    let deadline = opts.run_timeout.map(|t| Instant::now() + t);
    let retry = RetryPolicy {
        max_retries: opts.max_retries,
        backoff: opts.retry_backoff,
    };

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel::<SymbolReport>(opts.concurrency.max(1) * 2);

    for (index, symbol) in symbols.iter().cloned().enumerate() {
        let source = Arc::clone(&source);
        let fragments = Arc::clone(&fragments);
        let sem = Arc::clone(&semaphore);
        let gate = Arc::clone(&start_gate);
        let pacing = opts.pacing;
        let tx = tx.clone();

        tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.unwrap();

            if deadline.is_some_and(|d| Instant::now() >= d) {
                let _ = tx
                    .send(SymbolReport {
                        index,
                        symbol,
                        merged: None,
                        missing: Vec::new(),
                        errors: vec!["run timed out before pipeline start".to_string()],
                    })
                    .await;
                return;
            }

            pace(&gate, pacing).await;
            let report = scrape_symbol(source.as_ref(), &fragments, retry, index, symbol).await;
            let _ = tx.send(report).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish.
    drop(tx);

    let mut slots: Vec<Option<Outcome>> = (0..total).map(|_| None).collect();
    while let Some(report) = rx.recv().await {
        let status = match report.merged {
            Some(doc) => match db::upsert_document(conn, &report.symbol, &opts.dataset, &doc) {
                Ok(document_id) if report.missing.is_empty() => {
                    OutcomeStatus::Succeeded { document_id }
                }
                Ok(document_id) => OutcomeStatus::PartiallySucceeded {
                    document_id,
                    missing_fragments: report.missing,
                },
                Err(e) => OutcomeStatus::Failed {
                    reason: format!("persistence failed: {}", e),
                },
            },
            None => OutcomeStatus::Failed {
                reason: if report.errors.is_empty() {
                    "no data assembled".to_string()
                } else {
                    report.errors.join("; ")
                },
            },
        };
        if let OutcomeStatus::Failed { ref reason } = status {
            warn!("{}: {}", report.symbol, reason);
        }
        slots[report.index] = Some(Outcome {
            symbol: report.symbol,
            status,
        });
        pb.inc(1);
    }
    pb.finish_and_clear();

    let outcomes: Vec<Outcome> = slots
        .into_iter()
        .zip(symbols)
        .map(|(slot, symbol)| {
            slot.unwrap_or_else(|| Outcome {
                symbol: symbol.clone(),
                status: OutcomeStatus::Failed {
                    reason: "pipeline task aborted".to_string(),
                },
            })
        })
        .collect();

    let ok = outcomes
        .iter()
        .filter(|o| matches!(o.status, OutcomeStatus::Succeeded { .. }))
        .count();
    let partial = outcomes
        .iter()
        .filter(|o| matches!(o.status, OutcomeStatus::PartiallySucceeded { .. }))
        .count();
    info!(
        "scraped {} symbols ({} ok, {} partial, {} failed)",
        total,
        ok,
        partial,
        total - ok - partial
    );
    Ok(outcomes)
}

/// Space consecutive pipeline starts by `delay`. The gate holds the next
/// allowed start instant; each caller claims a slot and sleeps until it.
async fn pace(gate: &Mutex<Instant>, delay: Duration) {
    if delay.is_zero() {
        return;
    }
    let start = {
        let mut next = gate.lock().await;
        let start = (*next).max(Instant::now());
        *next = start + delay;
        start
    };
    tokio::time::sleep_until(start).await;
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

/// Fetch one leg, retrying transport-classed failures with exponential
/// backoff up to the configured attempt cap. Non-transport errors and
/// exhausted retries propagate to the caller.
async fn fetch_with_retry(
    source: &dyn PageSource,
    symbol: &str,
    profile: &FetchProfile,
    retry: RetryPolicy,
) -> Result<String, ScrapeError> {
    let mut attempt = 0;
    loop {
        match source.fetch(symbol, profile).await {
            Ok(body) => return Ok(body),
            Err(e) if e.is_transport() && attempt < retry.max_retries => {
                let backoff = retry.backoff * 2u32.pow(attempt);
                warn!(
                    "transient fetch failure for {} (attempt {}/{}), backing off {:.1}s: {}",
                    symbol,
                    attempt + 1,
                    retry.max_retries,
                    backoff.as_secs_f64(),
                    e
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One symbol's pipeline: fetch each configured leg, extract its fragments,
/// merge. Fully sequential internally. A failed leg marks its fragments
/// missing and continues; only a symbol with no data at all yields no
/// document.
async fn scrape_symbol(
    source: &dyn PageSource,
    fragments: &FragmentSet,
    retry: RetryPolicy,
    index: usize,
    symbol: String,
) -> SymbolReport {
    let mut result = ScrapeResult::new();
    let mut missing = Vec::new();
    let mut errors = Vec::new();

    match fetch_with_retry(source, &symbol, &FetchProfile::Static, retry).await {
        Ok(body) => {
            // Html is not Send: parse and extract in one scope so the handle
            // never lives across an await.
            let doc = Html::parse_document(&body);
            for desc in &fragments.static_fragments {
                if let Err(e) = result.insert(desc.name(), desc.extract(&doc)) {
                    missing.push(desc.name().to_string());
                    errors.push(e.to_string());
                }
            }
        }
        Err(e) => {
            warn!("static fetch failed for {}: {}", symbol, e);
            missing.extend(fragments.static_names());
            errors.push(e.to_string());
        }
    }

    if let Some(leg) = &fragments.rendered {
        let profile = FetchProfile::Rendered {
            wait_selector: leg.wait_selector.clone(),
            timeout: leg.timeout,
        };
        match fetch_with_retry(source, &symbol, &profile, retry).await {
            Ok(body) => {
                let doc = Html::parse_document(&body);
                for desc in &leg.fragments {
                    if let Err(e) = result.insert(desc.name(), desc.extract(&doc)) {
                        missing.push(desc.name().to_string());
                        errors.push(e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!("rendered fetch failed for {}: {}", symbol, e);
                missing.extend(fragments.rendered_names());
                errors.push(e.to_string());
            }
        }
    }

    let merged = if result.is_empty() {
        None
    } else {
        let empty = result.empty_fragment_names();
        if !empty.is_empty() {
            debug!("{}: sections absent on page: {}", symbol, empty.join(", "));
        }
        Some(merge_document(&symbol, &result))
    };
    SymbolReport {
        index,
        symbol,
        merged,
        missing,
        errors,
    }
}

// ── Tests ──
