//! perp-bot: LLM-advised perpetual-futures trading agent.
//!
//! Usage:
//!   perp-bot [OPTIONS]                 run the trading loop
//!   perp-bot set-lev <SYMBOL> <LEV>    one-shot leverage change (live)
//!
//! Options:
//!   -c, --config <FILE>   Config file path (default: config.local.json)
//!   -m, --mode <MODE>     live, sim, or backtest (default: auto by creds)
//!   --backtest-data <DIR> 3m kline CSV directory (implies backtest mode)
//!   --strategy <NAME>     active strategy (default: balanced)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use perp_bot::advisor::{AdvisorClient, AdvisorConfig};
use perp_bot::backtest_report;
use perp_bot::clock::{Clock, SystemClock};
use perp_bot::config::{BotConfig, DEFAULT_CONFIG_FILE};
use perp_bot::cycle_log::CycleLog;
use perp_bot::dashboard::{spawn_server, DashboardState};
use perp_bot::engine::TraderEngine;
use perp_bot::exchange::backtest::BacktestExchange;
use perp_bot::exchange::binance::{BinanceClient, BinanceExchange};
use perp_bot::exchange::simulated::SimulatedExchange;
use perp_bot::exchange::Exchange;
use perp_bot::history::TradeHistoryManager;
use perp_bot::storage::Storage;
use perp_bot::strategy::StrategyManager;

const FILL_SYNC_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(name = "perp-bot")]
#[command(about = "LLM-advised perpetual futures trading agent")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Trading mode: live, sim, backtest (default: live when exchange
    /// credentials are configured, sim otherwise)
    #[arg(short, long)]
    mode: Option<String>,

    /// Directory of {SYMBOL}_3m.csv files; implies backtest mode
    #[arg(long)]
    backtest_data: Option<PathBuf>,

    /// Active strategy name
    #[arg(long)]
    strategy: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Change the leverage for one symbol on the live exchange
    SetLev { symbol: String, leverage: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Live,
    Sim,
    Backtest,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(&e, dotenvy::Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("warning: failed to load .env: {e}");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = BotConfig::load(&args.config)?;

    if let Some(Command::SetLev { symbol, leverage }) = &args.command {
        return set_leverage_once(&config, symbol, *leverage).await;
    }

    let mode = resolve_mode(&args, &config)?;
    info!(?mode, "starting perp-bot");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let data_dir = PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;

    let storage = Arc::new(Storage::open(data_dir.join("storage.json"))?);
    storage.save_config_snapshot(clock.now(), &config.redacted(), "startup")?;

    let mut strategies = StrategyManager::new(&config.strategies_dir);
    if let Some(name) = &args.strategy {
        strategies
            .set_active(name)
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    let advisor = AdvisorClient::new(AdvisorConfig {
        api_url: config.advisor_api_url.clone(),
        api_key: config.advisor_api_key.clone(),
        model: config.advisor_model.clone(),
        proxy_url: config.proxy_url().map(str::to_string),
        ..Default::default()
    })?;

    let history = TradeHistoryManager::load(data_dir.join("trade_history.json"));

    // Assemble the exchange for the selected mode.
    let exchange: Arc<dyn Exchange> = match mode {
        Mode::Live => {
            let live = Arc::new(
                BinanceExchange::connect(
                    config.binance_api_key.clone(),
                    config.binance_secret_key.clone(),
                    config.proxy_url(),
                    data_dir.join("position_open_time.json"),
                    history.clone(),
                    clock.clone(),
                )
                .await?,
            );

            // Startup + periodic fill sync keeps the history aligned with
            // closes that happened outside the loop (stops, manual).
            let sync = live.clone();
            let sync_symbols = config.trading_symbols.clone();
            tokio::spawn(async move {
                sync.sync_trade_history(&sync_symbols).await;
                let mut ticker = tokio::time::interval(FILL_SYNC_INTERVAL);
                ticker.tick().await; // first tick is immediate
                loop {
                    ticker.tick().await;
                    sync.sync_trade_history(&sync_symbols).await;
                }
            });

            live
        }
        Mode::Sim => {
            info!(initial = config.initial_capital, "simulated exchange");
            Arc::new(SimulatedExchange::new(
                config.initial_capital,
                history.clone(),
                clock.clone(),
            ))
        }
        Mode::Backtest => {
            let dir = args
                .backtest_data
                .clone()
                .or_else(|| {
                    if config.backtest_data_dir.is_empty() {
                        None
                    } else {
                        Some(PathBuf::from(&config.backtest_data_dir))
                    }
                })
                .context("backtest mode requires --backtest-data or backtest_data_dir")?;
            Arc::new(BacktestExchange::from_csv_dir(
                config.initial_capital,
                &dir,
                &config.trading_symbols,
                history.clone(),
            )?)
        }
    };

    let dashboard = Arc::new(DashboardState::new(config.loop_interval_seconds));
    spawn_server(config.dashboard_port, dashboard.clone(), exchange.clone());

    let symbols = strategies.symbols(&config.trading_symbols).to_vec();
    let engine = TraderEngine::new(
        exchange,
        advisor,
        strategies,
        dashboard,
        storage,
        CycleLog::new(data_dir.join("trader.log")),
        clock.clone(),
        symbols,
        config.btc_eth_leverage,
        config.altcoin_leverage,
        mode != Mode::Backtest,
    );

    let equity_curve = engine.run().await?;

    // Only a finished backtest reaches this point; live and sim run until
    // the process is killed.
    if mode == Mode::Backtest {
        let report = backtest_report::build_report(
            config.initial_capital,
            equity_curve,
            history.history(),
            clock.now(),
        );
        backtest_report::save_report(&report, &data_dir.join("backtest_reports"))?;
        let s = &report.summary;
        info!(
            final_equity = s.final_equity,
            return_pct = s.total_return_pct,
            max_drawdown_pct = s.max_drawdown_pct,
            trades = s.total_trades,
            "backtest complete"
        );
    }

    Ok(())
}

fn resolve_mode(args: &Args, config: &BotConfig) -> Result<Mode> {
    if args.backtest_data.is_some() {
        return Ok(Mode::Backtest);
    }
    match args.mode.as_deref() {
        Some("live") => {
            if !config.has_live_credentials() {
                bail!("live mode requires binance_api_key and binance_secret_key");
            }
            Ok(Mode::Live)
        }
        Some("sim") | Some("simulated") | Some("paper") => Ok(Mode::Sim),
        Some("backtest") => Ok(Mode::Backtest),
        Some(other) => bail!("unknown mode: {other} (expected live, sim, or backtest)"),
        None => {
            if config.has_live_credentials() {
                Ok(Mode::Live)
            } else {
                Ok(Mode::Sim)
            }
        }
    }
}

/// One-shot `set-lev` subcommand against the live exchange.
async fn set_leverage_once(config: &BotConfig, symbol: &str, leverage: u32) -> Result<()> {
    if !config.has_live_credentials() {
        bail!(
            "set-lev needs live credentials: configure binance_api_key / binance_secret_key \
             in {DEFAULT_CONFIG_FILE}"
        );
    }
    if leverage == 0 {
        bail!("leverage must be positive");
    }

    let client = BinanceClient::new(
        config.binance_api_key.clone(),
        config.binance_secret_key.clone(),
        config.proxy_url(),
    )?;
    client
        .change_leverage(symbol, leverage)
        .await
        .with_context(|| format!("change leverage for {symbol}"))?;
    println!("leverage for {symbol} set to {leverage}x");
    Ok(())
}
