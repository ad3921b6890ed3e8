mod host;
mod logging;
mod page;

use anyhow::Context;
use clap::Parser;
use dom::DomService;
use sandbox::{ControlServer, Dispatcher, SessionConfig, StartPlan};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use host::{HttpFetcher, InlineStyleProvider};

/// Serve a script sandbox for one page over a Unix control socket
#[derive(Debug, Parser)]
#[command(name = "script-sandbox", version)]
struct Cli {
    /// Control socket path
    #[arg(short, long)]
    socket: PathBuf,

    /// URL the page lives at; XHR is limited to its origin
    #[arg(short, long)]
    url: Url,

    /// Read the page from this file instead of fetching the URL
    #[arg(long)]
    html: Option<PathBuf>,

    /// Scripts to run instead of the page's own, first one as bootstrap
    scripts: Vec<PathBuf>,

    /// Deadline per script turn
    #[arg(long, default_value_t = 60_000)]
    timeout_ms: u64,

    /// Silence window that ends change tracking
    #[arg(long, default_value_t = 1_000)]
    quiescence_ms: u64,

    #[arg(long, default_value_t = 100)]
    mutation_capacity: usize,

    /// Value of `Referrer()`, defaults to the page URL
    #[arg(long)]
    referrer: Option<String>,

    /// Engine heap limit in bytes
    #[arg(long)]
    memory_limit: Option<usize>,

    /// Engine stack limit in bytes
    #[arg(long)]
    max_stack_size: Option<usize>,

    /// Write each evaluated script here
    #[arg(long)]
    dump_script: Option<PathBuf>,

    /// Timeout for host-side HTTP requests
    #[arg(long, default_value_t = 30)]
    fetch_timeout_secs: u64,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            exec_timeout_ms: self.timeout_ms,
            quiescence_ms: self.quiescence_ms,
            mutation_capacity: self.mutation_capacity,
            page_url: self.url.to_string(),
            referrer: self.referrer.clone(),
            memory_limit: self.memory_limit,
            max_stack_size: self.max_stack_size,
            dump_script: self.dump_script.clone(),
            ..SessionConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let fetcher = Arc::new(HttpFetcher::new(
        cli.url.clone(),
        Duration::from_secs(cli.fetch_timeout_secs),
    )?);

    let html = page::load_html(cli.html.as_deref(), fetcher.as_ref()).await?;
    let dom = DomService::from_html(&html).context("failed to parse page")?;
    let scripts = page::load_scripts(&cli.scripts, &dom, fetcher.as_ref()).await?;

    let plan = StartPlan {
        config: cli.session_config(),
        html,
        scripts,
        fetcher,
        styles: Arc::new(InlineStyleProvider::new(dom)),
    };

    let server = ControlServer::bind(&cli.socket, Dispatcher::new(plan))
        .with_context(|| format!("failed to bind {}", cli.socket.display()))?;
    server.run().await?;
    Ok(())
}
