//! Stagehand CLI.
//!
//! `giftcard` runs the gift-card purchase recipe end to end: open a session,
//! select a denomination, add it to the cart and extract the cart and product
//! details. `observe` prints the ranked candidates of a page without calling a
//! reasoning backend.
//!
//! Usage examples:
//!   Browserbase (remote):
//!     $ BROWSERBASE_API_KEY=... BROWSERBASE_PROJECT_ID=... MODEL_API_KEY=... \
//!       cargo run --bin stagehand -- giftcard --env remote
//!   Local:
//!     $ MODEL_API_KEY=... cargo run --bin stagehand -- giftcard --show-browser
//!     $ cargo run --bin stagehand -- observe https://example.com

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde_json::Value as JsonValue;
use stagehand_grounding::browser::{BrowserLauncher, LocalPlan};
use stagehand_grounding::config::{Environment, StagehandConfig, Verbosity};
use stagehand_grounding::logging::StagehandLogger;
use stagehand_grounding::observer::PageObserver;
use stagehand_grounding::runtime::ChromiumoxideLauncher;
use stagehand_grounding::schema::{ExtractionSchema, SchemaField};
use stagehand_grounding::types::page::{
    ActionKind, ActionRequest, ExtractionRequest, ExtractionResult,
};
use stagehand_grounding::{Session, Stagehand};

const GIFT_CARD_URL: &str = "https://www.bitrefill.com/us/en/gift-cards/amazon_com-usa/";

#[derive(Parser)]
#[command(name = "stagehand", author, version, about = "Stagehand grounding CLI")]
struct Cli {
    /// Increase log verbosity (pass twice for debug output).
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select a gift card denomination, add it to the cart, and extract the result.
    Giftcard(GiftcardArgs),
    /// Print the ranked interaction candidates of a page.
    Observe(ObserveArgs),
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum EnvArg {
    Local,
    Remote,
}

impl From<EnvArg> for Environment {
    fn from(value: EnvArg) -> Self {
        match value {
            EnvArg::Local => Environment::Local,
            EnvArg::Remote => Environment::Remote,
        }
    }
}

#[derive(Args)]
struct GiftcardArgs {
    /// Where to run the browser. Defaults to STAGEHAND_ENV, else local.
    #[arg(long, value_enum)]
    env: Option<EnvArg>,

    #[arg(long, default_value = GIFT_CARD_URL)]
    url: String,

    /// Show the launched browser window (local only).
    #[arg(long)]
    show_browser: bool,
}

#[derive(Args)]
struct ObserveArgs {
    url: String,

    /// Number of candidates to print.
    #[arg(long, default_value_t = 25)]
    limit: usize,

    #[arg(long)]
    show_browser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env_logger();

    let cli = Cli::parse();
    let verbosity = verbosity_from_count(cli.verbose);

    match cli.command {
        Command::Giftcard(args) => run_giftcard(args, verbosity).await,
        Command::Observe(args) => run_observe(args, verbosity).await,
    }
}

async fn run_giftcard(args: GiftcardArgs, verbosity: Verbosity) -> Result<()> {
    let mut config = StagehandConfig::from_env().context("invalid configuration")?;
    config.verbose = verbosity;
    if let Some(env) = args.env {
        config.env = env.into();
    }
    if args.show_browser {
        config.headless = false;
    }

    let stagehand = Stagehand::builder(config)
        .build()
        .context("failed to set up Stagehand")?;
    let session = stagehand
        .open_session()
        .await
        .context("failed to open session")?;
    info!("Session {} opened ({})", session.id(), session.environment());

    let outcome = giftcard_flow(&session, &args.url).await;

    let closed = stagehand
        .close_session(&session)
        .await
        .context("failed to close session")?;
    outcome?;

    if let Some(recording) = closed.recording_ref {
        info!("View this session recording in your browser: {recording}");
    }
    info!("Backend usage: {:?}", stagehand.metrics());
    Ok(())
}

async fn giftcard_flow(session: &Session, url: &str) -> Result<()> {
    session
        .goto(url)
        .await
        .with_context(|| format!("failed to open {url}"))?;

    let selected = session
        .act(
            &ActionRequest::new("Click on an available gift card denomination")
                .with_kind(ActionKind::Click)
                .with_selector_hint(".package-select-button"),
        )
        .await
        .context("selecting a denomination failed")?;
    info!(
        "Selected denomination: {} (confidence {:.2}, {} attempt(s))",
        selected.description, selected.confidence, selected.attempts
    );

    tokio::time::sleep(Duration::from_secs(1)).await;

    let added = session
        .act(
            &ActionRequest::new("Click the Add to Cart button")
                .with_kind(ActionKind::Click)
                .with_selector_hint("button[data-testid='add-to-cart-button']"),
        )
        .await
        .context("adding to cart failed")?;
    info!("Add to cart: {}", added.description);

    let cart = session
        .extract(
            &ExtractionRequest::new("Extract the cart information", cart_schema())
                .text_projection(),
        )
        .await
        .context("cart extraction failed")?;
    report("Cart information", &cart);

    let gift_card = session
        .extract(
            &ExtractionRequest::new(
                "Extract the available Amazon gift card denominations and prices",
                gift_card_schema(),
            )
            .text_projection(),
        )
        .await
        .context("gift card extraction failed")?;
    report("Gift card information", &gift_card);

    Ok(())
}

fn cart_schema() -> ExtractionSchema {
    ExtractionSchema::object([
        SchemaField::required("itemAdded", ExtractionSchema::boolean()),
        SchemaField::optional("selectedAmount", ExtractionSchema::number()),
    ])
}

fn gift_card_schema() -> ExtractionSchema {
    ExtractionSchema::object([SchemaField::required(
        "giftCard",
        ExtractionSchema::object([
            SchemaField::required(
                "denominations",
                ExtractionSchema::array(ExtractionSchema::number()),
            ),
            SchemaField::required("currency", ExtractionSchema::string()),
            SchemaField::required("available", ExtractionSchema::boolean()),
        ]),
    )])
}

fn report(label: &str, result: &ExtractionResult) {
    match &result.data {
        Some(data) => info!("{label}: {data}"),
        None => {
            let errors = serde_json::to_value(&result.validation_errors)
                .unwrap_or(JsonValue::Null);
            warn!("{label} failed validation: {errors}");
        }
    }
}

async fn run_observe(args: ObserveArgs, verbosity: Verbosity) -> Result<()> {
    if args.limit == 0 {
        bail!("--limit must be at least 1");
    }
    let mut config = StagehandConfig::from_env().context("invalid configuration")?;
    config.verbose = verbosity;
    if args.show_browser {
        config.headless = false;
    }

    let logger = Arc::new(StagehandLogger::from_config(&config));
    let plan = LocalPlan::from_config(&config)?;
    let launcher = ChromiumoxideLauncher::new(Arc::clone(&logger));
    let driver = launcher
        .launch_local(&plan)
        .await
        .context("failed to start browser")?;

    let result = async {
        driver
            .navigate(&args.url)
            .await
            .with_context(|| format!("failed to open {}", args.url))?;
        driver
            .wait_for_stability(Duration::from_millis(config.dom_settle_timeout_ms))
            .await?;
        let snapshot = PageObserver::new(args.limit)
            .observe(driver.as_ref())
            .await
            .context("observation failed")?;
        for candidate in &snapshot.candidates {
            println!(
                "[{:>4}] {:<10} {:<8} {:<5} {}",
                candidate.id,
                candidate.role,
                candidate.tag,
                if candidate.interactable { "yes" } else { "no" },
                candidate.visible_text
            );
        }
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = driver.shutdown().await {
        warn!("browser shutdown failed: {err}");
    }
    result
}

fn verbosity_from_count(count: u8) -> Verbosity {
    match count {
        0 => Verbosity::Medium,
        _ => Verbosity::Detailed,
    }
}

fn init_env_logger() {
    if env::var("RUST_LOG").is_err() {
        unsafe {
            env::set_var("RUST_LOG", "info");
        }
    }

    let _ = env_logger::Builder::from_env(env_logger::Env::default())
        .format_timestamp_secs()
        .try_init();
}
