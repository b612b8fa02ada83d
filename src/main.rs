//! Yield Router - Main Entry Point
//!
//! Runs a simulated vault against in-memory strategy backends and inspects
//! persisted vault history.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use yield_router::backend::{BackendSet, LiquidBuffer, MockStrategy};
use yield_router::config::Config;
use yield_router::persistence::EventStore;
use yield_router::risk::StaticRiskOracle;
use yield_router::strategy::{NewStrategy, StrategyId, StrategyRegistry};
use yield_router::vault::{VaultLedger, VaultMetrics};
use yield_router::Vault;

/// Yield Router CLI
#[derive(Parser)]
#[command(name = "yield-router")]
#[command(version, about = "Multi-strategy capital allocation for pooled yield vaults")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a vault against simulated strategy backends
    Simulate {
        /// Number of maintenance ticks to run
        #[arg(short, long, default_value = "48")]
        ticks: u32,

        /// Pause between ticks in milliseconds
        #[arg(short, long, default_value = "0")]
        interval_ms: u64,

        /// Capital each simulated depositor brings
        #[arg(short, long, default_value = "250000")]
        deposit: Decimal,

        /// Run an emergency exit drill two thirds of the way through,
        /// with one strategy failing to unwind
        #[arg(long)]
        emergency_drill: bool,

        /// Event store path (defaults to persistence.db_path)
        #[arg(long)]
        db: Option<String>,
    },

    /// Rebuild the vault from its event store and show a summary
    Status {
        /// Event store path (defaults to persistence.db_path)
        #[arg(long)]
        db: Option<String>,

        /// Show per-strategy allocation lines
        #[arg(short, long)]
        verbose: bool,
    },

    /// List the most recent ledger events
    Events {
        /// Event store path (defaults to persistence.db_path)
        #[arg(long)]
        db: Option<String>,

        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config = Config::load().context("Failed to load configuration")?;
    config.validate()?;

    match cli.command {
        Commands::Simulate {
            ticks,
            interval_ms,
            deposit,
            emergency_drill,
            db,
        } => {
            let db = db.unwrap_or_else(|| config.persistence.db_path.clone());
            let settings = SimulationSettings {
                ticks,
                interval: Duration::from_millis(interval_ms),
                deposit,
                emergency_drill,
            };
            run_simulation(config, &db, settings).await
        }
        Commands::Status { db, verbose } => {
            let db = db.unwrap_or_else(|| config.persistence.db_path.clone());
            show_status(&config, &db, verbose)
        }
        Commands::Events { db, limit } => {
            let db = db.unwrap_or_else(|| config.persistence.db_path.clone());
            show_events(&db, limit)
        }
    }
}

/// A simulated strategy: registration parameters plus market behavior.
struct DemoStrategy {
    strategy: NewStrategy,
    apy: Decimal,
}

fn demo_strategies() -> Vec<DemoStrategy> {
    let demo = |id: &str, protocol: &str, risk: u32, apy: Decimal, capacity: Decimal, depth: Decimal| {
        DemoStrategy {
            strategy: NewStrategy {
                id: StrategyId::new(id),
                backend: id.to_string(),
                protocol: protocol.to_string(),
                risk_score: risk,
                capacity,
                min_deposit: dec!(100),
                current_yield: apy,
                liquidity_depth: depth,
            },
            apy,
        }
    };
    vec![
        demo("aave-usdc", "lending", 1500, dec!(0.045), dec!(2_000_000), dec!(50_000_000)),
        demo("curve-3pool", "liquidity", 3000, dec!(0.07), dec!(1_000_000), dec!(20_000_000)),
        demo("lido-steth", "staking", 2500, dec!(0.055), dec!(1_500_000), dec!(5_000_000)),
        demo("gmx-glp", "liquidity", 6500, dec!(0.16), dec!(500_000), dec!(2_000_000)),
    ]
}

struct SimulationSettings {
    ticks: u32,
    interval: Duration,
    deposit: Decimal,
    emergency_drill: bool,
}

async fn run_simulation(config: Config, db_path: &str, settings: SimulationSettings) -> Result<()> {
    let SimulationSettings {
        ticks,
        interval,
        deposit,
        emergency_drill,
    } = settings;
    info!("🚀 Starting vault simulation");
    log_config(&config);

    let store = EventStore::new(db_path)?;
    if store.event_count()? > 0 {
        warn!(db = db_path, "Clearing previous simulation history");
        store.clear_all()?;
    }

    let operator = config
        .vault
        .operators
        .first()
        .cloned()
        .context("At least one operator must be configured")?;

    let mut backends = BackendSet::new();
    let mut mocks = BTreeMap::new();
    let oracle = Arc::new(StaticRiskOracle::new());
    let demos = demo_strategies();
    for demo in &demos {
        let mock = Arc::new(MockStrategy::new(demo.apy, demo.strategy.liquidity_depth));
        backends.insert(demo.strategy.backend.clone(), mock.clone());
        mocks.insert(demo.strategy.id.clone(), mock);
        oracle.set_score(&demo.strategy.id, demo.strategy.risk_score);
    }

    let vault = Vault::new(config, backends, oracle.clone(), Arc::new(LiquidBuffer::new()))
        .with_store(store);
    for demo in demos {
        vault.register_strategy(&operator, demo.strategy).await?;
    }

    let depositors = ["alice", "bob", "carol"];
    for depositor in depositors {
        let shares = vault.deposit(deposit, depositor).await?;
        info!(depositor, %deposit, %shares, "Depositor joined");
    }
    vault.trigger_rebalance(&operator).await?;
    log_metrics(&vault.get_vault_metrics().await);

    for tick in 1..=ticks {
        // One simulated hour of yield per tick
        for mock in mocks.values() {
            let state = mock.get_state().await;
            let accrued = (state.balance * state.apy / dec!(8760)).round_dp(2);
            if accrued > Decimal::ZERO {
                mock.accrue(accrued).await;
            }
        }

        if tick == ticks / 3 {
            info!("📉 Simulating a risk spike on gmx-glp");
            oracle.set_score(&StrategyId::new("gmx-glp"), 9000);
        }
        if tick == ticks / 2 {
            if let Some(position) = vault.position("bob").await {
                let half = (position.shares / dec!(2)).round_dp(0);
                match vault.withdraw(half, "bob").await {
                    Ok(assets) => info!(%half, %assets, "bob withdrew half"),
                    Err(e) => warn!(error = %e, "bob's withdrawal failed"),
                }
            }
        }

        if emergency_drill && tick == ticks * 2 / 3 {
            run_emergency_drill(&vault, &mocks, &operator).await?;
        }

        match vault.tick().await {
            Ok(report) => {
                if report.rebalance.is_some() || !report.exits.is_empty() {
                    log_metrics(&vault.get_vault_metrics().await);
                }
            }
            Err(e) => error!(tick, error = %e, "Maintenance tick failed"),
        }

        if !interval.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Shutdown signal received");
                    break;
                }
            }
        }
    }

    let metrics = vault.get_vault_metrics().await;
    log_metrics(&metrics);
    for alert in vault.alerts().await {
        info!(severity = alert.severity.as_str(), "{}", alert.message);
    }
    info!(events = vault.events().await.len(), db = db_path, "✅ Simulation complete");
    Ok(())
}

/// Exit everything with one backend refusing to unwind, then recover it on
/// a later retry and leave emergency mode.
async fn run_emergency_drill(
    vault: &Vault,
    mocks: &BTreeMap<StrategyId, Arc<MockStrategy>>,
    operator: &str,
) -> Result<()> {
    info!("🚨 Emergency drill: curve-3pool will fail its first exit");
    let stubborn = mocks.get(&StrategyId::new("curve-3pool"));
    if let Some(mock) = stubborn {
        mock.fail_exit(true);
    }

    let report = vault.activate_emergency(operator, "simulated drill").await?;
    info!(
        recovered = %report.total_recovered,
        stuck = %report.total_stuck,
        stuck_strategies = report.stuck_strategies().len(),
        "Drill exit report"
    );

    if let Some(mock) = stubborn {
        mock.fail_exit(false);
    }
    let retried = vault.tick().await?;
    info!(retried = retried.retried.len(), "Stuck exits retried");

    vault.deactivate_emergency(operator).await?;
    for id in mocks.keys() {
        if let Err(e) = vault.reenable_strategy(operator, id).await {
            warn!(strategy = %id, error = %e, "Strategy left out after drill");
        }
    }
    log_metrics(&vault.get_vault_metrics().await);
    Ok(())
}

/// Initialize logging with file and console output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "yield-router.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("yield_router=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Base Asset: {}", config.vault.base_asset);
    info!(
        "   Idle Buffer: {:.1}% (drift {:.1}%)",
        config.vault.idle_buffer_ratio * dec!(100),
        config.vault.drift_threshold * dec!(100)
    );
    info!(
        "   Deposit Limits: {} - {}",
        config.vault.min_deposit, config.vault.max_deposit
    );
    info!("   Risk Ceiling: {}", config.allocation.risk_ceiling);
    info!(
        "   Emergency Exit Threshold: {}",
        config.risk.emergency_exit_threshold
    );
    info!(
        "   Max Single Allocation: {}",
        config.allocation.max_single_allocation
    );
    info!(
        "   Rebalance: every {}s, threshold {} bps",
        config.rebalance.min_interval_secs, config.rebalance.threshold_bps
    );
}

fn log_metrics(metrics: &VaultMetrics) {
    info!(
        total_capital = %metrics.total_capital,
        idle = %metrics.idle,
        share_price = %metrics.share_price.round_dp(6),
        weighted_yield = %metrics.weighted_yield.round_dp(4),
        emergency = metrics.emergency,
        "📊 Vault"
    );
    for line in &metrics.allocations {
        info!(
            strategy = %line.strategy_id,
            status = %line.status,
            allocation = %line.allocation,
            target = %line.target_allocation,
            risk = line.risk_score,
            "   └─"
        );
    }
}

/// Rebuild the ledger from the event store and print a summary.
fn show_status(config: &Config, db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              VAULT STATUS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Event store not found: {}", db_path);
        println!("   Run `yield-router simulate` first, or pass --db.");
        return Ok(());
    }

    let store = EventStore::new(db_path)?;
    let events = store.load_events()?;
    if events.is_empty() {
        println!("\n❌ No events recorded in {}", db_path);
        return Ok(());
    }
    let event_count = events.len();

    let registry = StrategyRegistry::new(
        config.allocation.max_single_allocation,
        config.allocation.risk_ceiling,
        config.risk.emergency_exit_threshold,
    );
    let ledger = VaultLedger::replay(registry, config.vault.amount_scale, events)
        .context("Event history does not replay cleanly")?;
    let consistent = ledger.check_invariants().is_ok();
    let metrics = ledger.metrics();

    println!("\n📊 Vault Summary");
    println!("   ├─ Total Capital:    {}", metrics.total_capital);
    println!("   ├─ Idle:             {}", metrics.idle);
    println!("   ├─ Total Shares:     {}", metrics.total_shares);
    println!("   ├─ Share Price:      {:.6}", metrics.share_price);
    println!("   ├─ Weighted Yield:   {:.2}%", metrics.weighted_yield * dec!(100));
    println!("   ├─ Pending Yield:    {}", metrics.pending_yield);
    println!("   └─ Written Off:      {}", metrics.written_off);

    println!("\n🚦 Flags");
    println!("   ├─ Emergency:        {}", metrics.emergency);
    println!("   ├─ Halted:           {}", metrics.halted);
    println!("   ├─ Paused:           {}", metrics.paused);
    println!("   ├─ Consistent:       {}", consistent);
    match metrics.last_rebalance {
        Some(at) => println!("   └─ Last Rebalance:   {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("   └─ Last Rebalance:   never"),
    }

    println!("\n📈 Activity");
    println!("   ├─ Events:           {}", event_count);
    println!("   ├─ Depositors:       {}", ledger.positions().count());
    println!("   └─ Strategies:       {}", metrics.allocations.len());

    if verbose && !metrics.allocations.is_empty() {
        println!("\n🏦 Allocations");
        for line in &metrics.allocations {
            println!("   ┌─ {} ({})", line.strategy_id, line.protocol);
            println!("   │  ├─ Status:     {}", line.status);
            println!("   │  ├─ Allocation: {} / cap {}", line.allocation, line.cap);
            println!("   │  ├─ Target:     {}", line.target_allocation);
            println!("   │  ├─ Yield:      {:.2}%", line.current_yield * dec!(100));
            println!("   │  └─ Risk:       {}", line.risk_score);
        }
    }

    let snapshots = store.recent_snapshots(5)?;
    if !snapshots.is_empty() {
        println!("\n🕒 Recent Snapshots");
        for snapshot in snapshots {
            println!(
                "   ├─ {}  capital {}  price {:.6}",
                snapshot.timestamp.format("%H:%M:%S"),
                snapshot.total_capital,
                snapshot.share_price
            );
        }
    }

    Ok(())
}

fn show_events(db_path: &str, limit: usize) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("❌ Event store not found: {}", db_path);
        return Ok(());
    }
    let store = EventStore::new(db_path)?;
    let total = store.event_count()?;
    println!("📜 {} of {} events (newest first)", limit.min(total as usize), total);
    for event in store.recent_events(limit)? {
        println!(
            "   {}  {:<22} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.kind.name(),
            serde_json::to_string(&event.kind)?
        );
    }
    Ok(())
}
