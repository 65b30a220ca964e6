use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;
use url::Url;

use frontier_bridge::js::run_document_scripts;
use frontier_bridge::{BackendManager, BridgeConfig, Page};

const USAGE: &str = "usage: frontier-bridge <page.html> [sandbox-kind|none]";

fn main() {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let path = PathBuf::from(args.next().ok_or_else(|| anyhow!(USAGE))?);
    let kind_arg = args.next();

    let config = BridgeConfig::from_env().context("failed to load bridge configuration")?;
    let kind = match kind_arg.as_deref() {
        Some("none") => None,
        Some(kind) => Some(kind.to_string()),
        None => config.default_sandbox.clone(),
    };

    let html = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let absolute = path
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    let url = Url::from_file_path(&absolute)
        .map_err(|_| anyhow!("cannot express {} as a file url", absolute.display()))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let page = Page::new(url);
    let document = page.load_document(&html);
    let manager = BackendManager::new(config, page.clone());

    let local = LocalSet::new();
    let summary = local.block_on(
        &rt,
        run_document_scripts(&manager, Rc::clone(&document), kind.as_deref()),
    )?;
    manager.stop_all();

    println!("{}", document.to_html());
    for url in page.take_navigations() {
        println!("navigate: {url}");
    }
    for message in page.alerts() {
        println!("alert: {message}");
    }
    tracing::info!(
        documents = summary.documents,
        executed = summary.executed_scripts,
        failed = summary.failed_scripts,
        "done"
    );
    Ok(())
}
