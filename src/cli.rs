//! CLI definition and dispatch.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::adapters::checkpoint_store::CheckpointStore;
use crate::adapters::csv_data_adapter::CsvMarketDataSource;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::{BacktestSummary, Backtester};
use crate::domain::config_validation::{EngineKind, RunConfig};
use crate::domain::error::TradeLoopError;
use crate::domain::series::BacktestMarketDataSource;
use crate::domain::strategy::VectorizedStrategy;
use crate::domain::sweep::run_sweep;
use crate::ports::market_data_port::MarketDataSource;

#[derive(Parser, Debug)]
#[command(name = "tradeloop", about = "Order ledger, backtester and strategy runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the configured strategies over the configured date range
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Write the run summaries as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the strategy/date-range sweep with checkpoint resume
    Sweep {
        #[arg(short, long)]
        config: PathBuf,
        /// Checkpoint directory
        #[arg(short, long)]
        storage: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Backtest { config, output } => run_backtest(&config, output.as_ref()),
        Command::Sweep { config, storage } => run_cli_sweep(&config, &storage),
        Command::Validate { config } => run_validate(&config),
    }
}

fn load_run_config(path: &PathBuf) -> Result<RunConfig, ExitCode> {
    eprintln!("Loading config from {}", path.display());
    let adapter = FileConfigAdapter::from_file(path).map_err(|e| {
        eprintln!("error: {e}");
        ExitCode::from(&e)
    })?;
    RunConfig::load(&adapter).map_err(|e| {
        eprintln!("error: {e}");
        ExitCode::from(&e)
    })
}

fn build_sources(
    run: &RunConfig,
) -> Result<HashMap<String, BacktestMarketDataSource>, TradeLoopError> {
    let mut sources = HashMap::new();
    for source in &run.sources {
        let path = run.data_dir.join(&source.file);
        eprintln!("Loading {} from {}", source.identifier, path.display());
        let live = CsvMarketDataSource::load(
            &source.identifier,
            &path,
            &source.symbol,
            source.time_frame,
            source.window_size,
        )?;
        sources.insert(source.identifier.clone(), live.to_backtest_variant()?);
    }
    Ok(sources)
}

fn write_summaries(
    summaries: &[BacktestSummary],
    output: Option<&PathBuf>,
) -> Result<(), TradeLoopError> {
    let json = serde_json::to_string_pretty(summaries).map_err(|e| TradeLoopError::Storage {
        reason: format!("cannot serialize summaries: {e}"),
    })?;
    match output {
        Some(path) => {
            fs::write(path, &json)?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn run_backtest(config_path: &PathBuf, output: Option<&PathBuf>) -> ExitCode {
    let run = match load_run_config(config_path) {
        Ok(run) => run,
        Err(code) => return code,
    };
    let result = build_sources(&run).and_then(|sources| {
        let backtester = Backtester::new(run.backtest.clone());
        let mut summaries = Vec::new();
        for strategy_config in &run.strategies {
            let mut strategy = strategy_config.build()?;
            eprintln!("Running {} ({:?})", strategy_config.id, run.engine);
            let result = match run.engine {
                EngineKind::EventDriven => backtester.run_event_driven(&mut strategy, &sources)?,
                EngineKind::Vectorized => backtester.run_vectorized(&strategy, &sources)?,
            };
            eprintln!(
                "  net gain {:.2}, {} orders, {} trades",
                result.summary.total_net_gain, result.summary.orders, result.summary.trades_opened
            );
            summaries.push(result.summary);
        }
        write_summaries(&summaries, output)
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(&e)
        }
    }
}

fn run_cli_sweep(config_path: &PathBuf, storage: &PathBuf) -> ExitCode {
    let run = match load_run_config(config_path) {
        Ok(run) => run,
        Err(code) => return code,
    };
    let Some(sweep) = run.sweep.clone() else {
        let err = TradeLoopError::ConfigMissing {
            section: "sweep".into(),
            key: "ranges".into(),
        };
        eprintln!("error: {err}");
        return ExitCode::from(&err);
    };
    let result = build_sources(&run).and_then(|sources| {
        let store = CheckpointStore::new(storage.clone(), sweep.mode)?;
        let strategies = run
            .strategies
            .iter()
            .map(|s| s.build().map(|b| Box::new(b) as Box<dyn VectorizedStrategy>))
            .collect::<Result<Vec<_>, _>>()?;
        eprintln!(
            "Sweeping {} strategies over {} ranges",
            strategies.len(),
            sweep.ranges.len()
        );
        let report = run_sweep(&strategies, &sweep.ranges, &run.backtest, &sources, &store)?;
        eprintln!(
            "Computed {} runs, reused {} from checkpoints",
            report.produced.len(),
            report.reused.len()
        );
        let mut all = report.reused;
        all.extend(report.produced);
        write_summaries(&all, None)
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(&e)
        }
    }
}

fn run_validate(config_path: &PathBuf) -> ExitCode {
    match load_run_config(config_path) {
        Ok(run) => {
            eprintln!(
                "Config OK: {} sources, {} strategies{}",
                run.sources.len(),
                run.strategies.len(),
                if run.sweep.is_some() { ", sweep configured" } else { "" }
            );
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}
