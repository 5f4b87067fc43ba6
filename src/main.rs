//! Swap Momentum - Main Entry Point
//!
//! Runs the rebalance scheduler against Binance USDⓈ-M futures, either live or
//! with paper execution on live market data.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swap_momentum::config::Config;
use swap_momentum::exchange::{
    BinanceClient, ExecutionGateway, GatewayError, MarketDataGate, PaperExchange, PositionFilter,
};
use swap_momentum::persistence::CycleJournal;
use swap_momentum::strategy::{CycleReport, RebalanceScheduler, ShutdownSignal};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Swap Momentum CLI
#[derive(Parser)]
#[command(name = "swap-momentum")]
#[command(version, about = "Cross-sectional momentum rebalancing on perpetual swaps")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C (default)
    Run {
        /// Execute on a paper account instead of the live venue
        #[arg(long)]
        paper: bool,

        /// Starting balance of the paper account
        #[arg(long, default_value = "10000")]
        paper_balance: Decimal,
    },

    /// Run a single cycle and exit
    Once {
        /// Execute on a paper account instead of the live venue
        #[arg(long)]
        paper: bool,

        /// Starting balance of the paper account
        #[arg(long, default_value = "10000")]
        paper_balance: Decimal,

        /// Print targets and planned actions without touching orders
        #[arg(long)]
        dry_run: bool,
    },

    /// Cancel resting orders and close every open position
    CloseAll {
        /// Print the positions that would be closed without placing orders
        #[arg(long)]
        dry_run: bool,
    },

    /// Show recent cycles from the journal
    Status {
        /// Number of cycles to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Journal path (defaults to persistence.journal_path)
        #[arg(short, long)]
        db: Option<PathBuf>,
    },
}

type Scheduler = RebalanceScheduler<dyn MarketDataGate, dyn ExecutionGateway>;

/// Where orders go.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ExecutionMode {
    Live,
    Paper(Decimal),
    /// Read-only view of the live account; nothing is cancelled or placed
    Preview,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_json)?;

    let config = Config::load()?;

    let command = cli.command.unwrap_or(Commands::Run {
        paper: false,
        paper_balance: Decimal::new(10000, 0),
    });

    match command {
        Commands::Run {
            paper,
            paper_balance,
        } => run(config, paper, paper_balance).await,
        Commands::Once {
            paper,
            paper_balance,
            dry_run,
        } => once(config, paper, paper_balance, dry_run).await,
        Commands::CloseAll { dry_run } => close_all(config, dry_run).await,
        Commands::Status { limit, db } => {
            let path = db.unwrap_or_else(|| config.persistence.journal_path.clone());
            show_status(&path, limit)
        }
    }
}

async fn run(config: Config, paper: bool, paper_balance: Decimal) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║              Swap Momentum v{}                          ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let mode = if paper {
        ExecutionMode::Paper(paper_balance)
    } else {
        ExecutionMode::Live
    };
    let mut scheduler = build_scheduler(config, mode, true).await?;

    let shutdown = ShutdownSignal::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        trigger.trigger();
    });

    info!("🚀 Starting scheduler loop...");
    scheduler.run(&shutdown).await;

    info!("👋 Swap Momentum shutdown complete");
    Ok(())
}

async fn once(config: Config, paper: bool, paper_balance: Decimal, dry_run: bool) -> Result<()> {
    let mode = match (paper, dry_run) {
        (true, _) => ExecutionMode::Paper(paper_balance),
        (false, true) => ExecutionMode::Preview,
        (false, false) => ExecutionMode::Live,
    };
    let blind = is_blind_preview(&config, mode);
    let mut scheduler = build_scheduler(config, mode, !dry_run).await?;

    let report = if dry_run {
        scheduler.plan().await
    } else {
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            trigger.trigger();
        });
        scheduler.run_cycle(&shutdown).await
    };

    print_report(&report);
    if blind {
        print_blind_preview_notice();
    }

    if let Some(e) = report.error {
        anyhow::bail!("Cycle aborted: {}", e);
    }
    Ok(())
}

async fn close_all(config: Config, dry_run: bool) -> Result<()> {
    let mode = if dry_run {
        ExecutionMode::Preview
    } else {
        ExecutionMode::Live
    };
    let blind = is_blind_preview(&config, mode);
    let mut scheduler = build_scheduler(config, mode, false).await?;

    let shutdown = ShutdownSignal::new();
    if !dry_run {
        warn!("🧹 Closing ALL positions");
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            trigger.trigger();
        });
    }

    let report = scheduler.close_all(&shutdown, dry_run).await;
    print_report(&report);
    if blind {
        print_blind_preview_notice();
    }

    if let Some(e) = report.error {
        anyhow::bail!("Close-all aborted: {}", e);
    }
    Ok(())
}

/// A preview without credentials cannot read the live account.
fn is_blind_preview(config: &Config, mode: ExecutionMode) -> bool {
    mode == ExecutionMode::Preview
        && (config.exchange.api_key.is_empty() || config.exchange.secret_key.is_empty())
}

fn print_blind_preview_notice() {
    println!("⚠️  No API credentials configured: live positions were not read.");
    println!("   This plan assumes an empty account and shows no closes or kept positions.\n");
}

/// Wire the gateways, journal and scheduler.
///
/// Paper mode reads market data from the live venue and fills orders in memory.
async fn build_scheduler(
    config: Config,
    mode: ExecutionMode,
    with_journal: bool,
) -> Result<Scheduler> {
    config.validate()?;
    log_config(&config, mode);

    let client = Arc::new(BinanceClient::new(&config.exchange)?);
    let market: Arc<dyn MarketDataGate> = client.clone();

    let gateway: Arc<dyn ExecutionGateway> = match mode {
        ExecutionMode::Paper(balance) => {
            info!("📝 PAPER TRADING MODE - balance ${}", balance);
            Arc::new(PaperExchange::new(balance))
        }
        ExecutionMode::Preview if !client.has_credentials() => {
            warn!("🔍 PREVIEW without API credentials - live positions are ignored, the plan assumes an empty account");
            Arc::new(PaperExchange::new(Decimal::ZERO))
        }
        ExecutionMode::Preview => {
            info!("🔍 PREVIEW MODE - reading live positions, no orders will be placed");
            verify_credentials(client.as_ref()).await?;
            client
        }
        ExecutionMode::Live => {
            warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
            verify_credentials(client.as_ref()).await?;
            client
        }
    };

    let journal = if with_journal {
        open_journal(&config.persistence.journal_path)
    } else {
        None
    };

    let scheduler = RebalanceScheduler::new(config, market, gateway, journal).await?;
    info!(
        "✅ [INIT] {} instruments in universe",
        scheduler.universe().len()
    );
    Ok(scheduler)
}

/// Fail startup on missing or rejected credentials.
async fn verify_credentials(client: &BinanceClient) -> Result<()> {
    anyhow::ensure!(
        client.has_credentials(),
        "Live trading requires exchange.api_key and exchange.secret_key"
    );

    match client.fetch_positions(&PositionFilter::All).await {
        Ok(positions) => {
            info!("✅ [INIT] Authenticated, {} open positions", positions.len());
            Ok(())
        }
        Err(e @ GatewayError::Auth(_)) => Err(e).context("Exchange authentication failed"),
        Err(e) => {
            // Not an auth failure; the scheduler's own reads will retry
            warn!(error = %e, "Could not verify credentials at startup");
            Ok(())
        }
    }
}

fn open_journal(path: &Path) -> Option<CycleJournal> {
    match CycleJournal::open(path) {
        Ok(journal) => Some(journal),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Cycle journal unavailable, continuing without it");
            None
        }
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "swap-momentum.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("swap_momentum=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.json().with_current_span(true).init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config, mode: ExecutionMode) {
    let strategy = &config.strategy;
    info!("📋 Configuration:");
    info!(
        "   Mode: {}",
        match mode {
            ExecutionMode::Live => "live",
            ExecutionMode::Paper(_) => "paper",
            ExecutionMode::Preview => "preview",
        }
    );
    info!("   Sandbox: {}", config.exchange.sandbox);
    info!("   Universe: {}", strategy.universe.join(", "));
    info!(
        "   Legs: {} long / {} short @ ${} each",
        strategy.long_n, strategy.short_n, strategy.target_notional_per_leg
    );
    info!(
        "   Scoring: {:?} on {} x {} bars",
        strategy.scoring, config.market_data.lookback_bars, config.market_data.candle_timeframe
    );
    if strategy.reverse_window.enabled {
        let window = &strategy.reverse_window;
        info!(
            "   Reverse window: {} {:02}:00 → {} {:02}:00 UTC",
            window.start_weekday, window.start_hour, window.end_weekday, window.end_hour
        );
    }
    info!(
        "   Rebalance every {}s (tick {}s)",
        config.schedule.rebalance_interval_secs, config.schedule.tick_secs
    );
    info!(
        "   Leverage: {}x {:?}",
        config.execution.max_leverage, config.execution.margin_mode
    );
}

fn print_report(report: &CycleReport) {
    let context = &report.context;

    println!("\n🎯 Targets{}", if report.reversed { " (reversed)" } else { "" });
    for (instrument, score) in &context.scores {
        let target = context.target.target_of(instrument);
        println!(
            "   ├─ {:<12} {:>10}  {:<5} {}",
            instrument.symbol(),
            score,
            target.direction,
            target.notional
        );
    }
    for (instrument, reason) in &context.skipped {
        println!("   ├─ {:<12} skipped: {}", instrument.symbol(), reason);
    }
    if context.target.insufficient_universe {
        println!("   └─ insufficient universe, no new positions");
    }

    println!("\n📋 Actions");
    if context.reconciliation.actions.is_empty() {
        println!("   └─ none");
    }
    if report.dry_run {
        for action in &context.reconciliation.actions {
            println!("   ├─ {}", action);
        }
    } else {
        for record in &context.execution.records {
            println!("   ├─ {} → {}", record.action, record.status);
        }
        for action in &context.execution.unexecuted {
            println!("   ├─ {} → not executed", action);
        }
    }

    println!(
        "\n📊 scored {} | skipped {} | opened {} | closed {} | kept {} | failed {}",
        report.scored(),
        report.skipped(),
        report.opened(),
        report.closed(),
        report.kept(),
        report.failed()
    );
    if let Some(e) = &report.error {
        println!("❌ {}", e);
    }
    println!();
}

fn show_status(path: &Path, limit: usize) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              SWAP MOMENTUM STATUS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !path.exists() {
        println!("\n❌ Journal not found: {}", path.display());
        println!("   The scheduler has not run yet, or the journal path is incorrect.");
        return Ok(());
    }

    let journal = CycleJournal::open(path)?;

    match journal.last_success()? {
        Some(last) => println!(
            "\n✅ Last successful cycle: {}",
            last.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("\n❌ No successful cycle recorded"),
    }

    let cycles = journal.recent(limit)?;
    if cycles.is_empty() {
        println!();
        return Ok(());
    }

    println!("\n📈 Recent Cycles");
    for cycle in &cycles {
        let state = match (&cycle.error, cycle.interrupted) {
            (Some(_), _) => "aborted",
            (None, true) => "interrupted",
            (None, false) => "ok",
        };
        println!(
            "   ┌─ #{} {} [{}]{}",
            cycle.number,
            cycle.started_at.format("%Y-%m-%d %H:%M:%S"),
            state,
            if cycle.reversed { " reversed" } else { "" }
        );
        println!(
            "   ├─ scored {} | skipped {} | opened {} | closed {} | kept {} | failed {}",
            cycle.scored, cycle.skipped, cycle.opened, cycle.closed, cycle.kept, cycle.failed
        );
        if let Some(e) = &cycle.error {
            println!("   ├─ error: {}", e);
        }

        for order in journal.orders_for(cycle.id)? {
            println!(
                "   ├─ {} {} {} qty={} → {}{}",
                order.action,
                order.side,
                order.symbol,
                order.quantity.as_deref().unwrap_or("-"),
                order.outcome,
                order
                    .order_id
                    .as_deref()
                    .or(order.detail.as_deref())
                    .map(|s| format!(" ({})", s))
                    .unwrap_or_default()
            );
        }
        println!("   └─");
    }

    println!();
    Ok(())
}
