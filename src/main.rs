use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

use screener_scraper::db;
use screener_scraper::extract::FragmentSet;
use screener_scraper::fetch::HttpPageSource;
use screener_scraper::pipeline::{self, PipelineOptions};
use screener_scraper::render::{ChromeRenderer, Renderer};

const BASE_URL: &str = "https://www.screener.in";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";

#[derive(Parser)]
#[command(name = "screener_scraper", about = "Stock fundamentals scraper for screener.in")]
struct Cli {
    /// Path to the sqlite database
    #[arg(long, default_value = db::DEFAULT_DB_PATH)]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load ticker symbols into the catalog from a file (one per line,
    /// commas also accepted)
    Import { file: String },
    /// Scrape symbols and persist one merged document each
    Scrape {
        /// Comma-separated symbols; defaults to the stored catalog
        #[arg(short, long)]
        symbols: Option<String>,
        /// Max symbols to scrape when draining the catalog
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Max symbol pipelines in flight
        #[arg(short, long, default_value = "4")]
        concurrency: usize,
        /// Delay between consecutive pipeline starts, in milliseconds
        #[arg(long, default_value = "1000")]
        delay_ms: u64,
        /// Stop issuing new pipeline starts after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Max retries per page fetch on transient errors
        #[arg(long, default_value = "3")]
        retries: u32,
        /// Skip the browser-rendered peer-comparison leg
        #[arg(long)]
        no_render: bool,
        /// Dataset tag documents are stored under
        #[arg(long, default_value = "fundamentals")]
        dataset: String,
        /// Print outcomes as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the stored document for one symbol
    Show {
        symbol: String,
        #[arg(long, default_value = "fundamentals")]
        dataset: String,
    },
    /// Show catalog and document counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let conn = db::connect(&cli.db)?;
    db::init_schema(&conn)?;

    match cli.command {
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let symbols: Vec<String> = raw
                .split(|c| c == '\n' || c == ',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            let inserted = db::import_symbols(&conn, &symbols)?;
            println!("Imported {} new symbols ({} in file)", inserted, symbols.len());
        }
        Commands::Scrape {
            symbols,
            limit,
            concurrency,
            delay_ms,
            timeout_secs,
            retries,
            no_render,
            dataset,
            json,
        } => {
            let symbols = match symbols {
                Some(raw) => pipeline::parse_symbol_list(&raw)?,
                None => db::list_symbols(&conn, limit)?,
            };
            if symbols.is_empty() {
                println!("No symbols. Pass --symbols or run 'import' first.");
                return Ok(());
            }

            let mut fragments = FragmentSet::screener_default()?;
            let mut chrome: Option<Arc<ChromeRenderer>> = None;
            let renderer: Option<Arc<dyn Renderer>> = if no_render {
                fragments = fragments.without_rendered();
                None
            } else {
                match ChromeRenderer::launch().await {
                    Ok(r) => {
                        let r = Arc::new(r);
                        chrome = Some(Arc::clone(&r));
                        Some(r)
                    }
                    Err(e) => {
                        warn!("browser launch failed, continuing static-only: {}", e);
                        fragments = fragments.without_rendered();
                        None
                    }
                }
            };

            let client = reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(30))
                .build()?;
            let source = Arc::new(HttpPageSource::new(client, BASE_URL, renderer));

            let opts = PipelineOptions {
                concurrency,
                pacing: Duration::from_millis(delay_ms),
                dataset,
                run_timeout: timeout_secs.map(Duration::from_secs),
                max_retries: retries,
                ..PipelineOptions::default()
            };

            println!("Scraping {} symbols...", symbols.len());
            let result = pipeline::run(&conn, source, Arc::new(fragments), &opts, &symbols).await;

            // Close the browser before reporting, whether the run succeeded.
            if let Some(chrome) = chrome {
                chrome.shutdown().await;
            }

            let outcomes = result?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcomes)?);
            } else {
                for outcome in &outcomes {
                    println!(
                        "{:<12} {:<8} {}",
                        outcome.symbol,
                        outcome.label(),
                        outcome.detail()
                    );
                }
            }
        }
        Commands::Show { symbol, dataset } => {
            let symbol = symbol.trim().to_uppercase();
            match db::fetch_document(&conn, &symbol, &dataset)? {
                Some(raw) => {
                    let doc: serde_json::Value = serde_json::from_str(&raw)?;
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
                None => println!("No document for {} in dataset '{}'.", symbol, dataset),
            }
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Symbols:   {}", s.symbols);
            println!("Documents: {}", s.documents);
            println!("Datasets:  {}", s.datasets);
        }
    }

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {:.1}s", elapsed.as_secs_f64());
    }
    Ok(())
}
