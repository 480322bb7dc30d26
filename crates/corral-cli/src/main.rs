use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use corral::{Coordinator, Mode, Registry, Severity};
use corral_contracts::CORRAL_REPORT_SCHEMA_VERSION;

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Inspect the native concurrency backends loaded in this process.", long_about = None)]
struct Cli {
    /// Emit machine-readable JSON instead of a table.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List classified runtimes mapped into this process.
    List,
    /// Evaluate conflict rules over the current snapshot.
    Check {
        /// Exit nonzero when a fatal finding exists.
        #[arg(long)]
        strict: bool,
    },
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    let registry = Arc::new(Registry::new());
    let coordinator = Coordinator::new(registry, Mode::Warn);

    match cli.cmd {
        Cmd::List => {
            let snapshot = coordinator.list_runtimes();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&snapshot.report())?);
            } else if snapshot.records.is_empty() {
                println!("no known concurrency backends detected");
            } else {
                for report in snapshot.report().runtimes {
                    println!(
                        "{}\n  vendor={:?} kind={:?} fork_safe={} controllable={} workers={}/{}",
                        report.path.display(),
                        report.vendor,
                        report.api_kind,
                        report.fork_safe,
                        report.controllable,
                        report.current_limit,
                        report.native_max,
                    );
                }
            }
            Ok(std::process::ExitCode::SUCCESS)
        }
        Cmd::Check { strict } => {
            let findings = coordinator.check_conflicts();
            let fatal = findings.iter().any(|f| f.severity == Severity::Fatal);
            if cli.json {
                let doc = json!({
                    "schema_version": CORRAL_REPORT_SCHEMA_VERSION,
                    "findings": findings,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else if findings.is_empty() {
                println!("no findings");
            } else {
                for finding in &findings {
                    println!("[{:?}] {}: {}", finding.severity, finding.rule_id, finding.message);
                }
            }
            if strict && fatal {
                return Ok(std::process::ExitCode::from(1));
            }
            Ok(std::process::ExitCode::SUCCESS)
        }
    }
}
