use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use iceperf::config::{Config, LogFormat, LoggingConfig};
use iceperf::provider::{self, RunContext};
use iceperf::report::{table, HttpReporter, ReportSink};
use iceperf::selftest::TestStatus;
use iceperf::stats::Stats;

#[derive(Parser)]
#[command(
    name = "iceperf",
    about = "Connectivity and throughput benchmarking for STUN/TURN relay providers",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test every server of every enabled provider
    Run {
        /// Config file (defaults to $ICEPERF_CONFIG, then ./iceperf.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Report results to this URI
        #[arg(long)]
        api_uri: Option<String>,

        /// Bearer token for the report URI
        #[arg(long)]
        api_key: Option<String>,

        /// Repeat the sweep on the configured interval until interrupted
        #[arg(long)]
        timer: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Resolve providers and print their servers without testing them
    ListServers {
        /// Config file (defaults to $ICEPERF_CONFIG, then ./iceperf.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Drive the harness over the in-process loopback engine
    SelfTest {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            api_uri,
            api_key,
            timer,
            json,
        } => {
            let mut config = Config::resolve(config.as_deref())?;
            init_tracing(&config.logging);

            match api_uri {
                Some(uri) => config.override_report(uri, api_key),
                None => {
                    if let Some(key) = api_key {
                        config.report.api_key = key;
                    }
                }
            }
            if timer {
                config.timer.enabled = true;
            }
            config.validate()?;

            let engine = iceperf::default_engine().context("failed to create WebRTC engine")?;
            let sink = HttpReporter::from_config(&config.report)
                .context("failed to create result reporter")?
                .map(|reporter| Arc::new(reporter) as Arc<dyn ReportSink>);

            if config.timer.enabled {
                iceperf::runner::run_forever(&config, engine, sink, |results| {
                    if let Err(e) = print_results(results, json) {
                        tracing::warn!(error = %e, "failed to print results");
                    }
                })
                .await?;
            } else {
                let results = iceperf::runner::run_all(&config, engine, sink).await?;
                print_results(&results, json)?;
            }
        }
        Commands::ListServers { config } => {
            let config = Config::resolve(config.as_deref())?;
            init_tracing(&config.logging);
            config.validate()?;

            let ctx = RunContext::new(uuid::Uuid::new_v4().to_string())
                .context("failed to build provider http client")?;
            let resolved = provider::collect(&config, &ctx).await;
            if let Some(node) = &resolved.node {
                println!("Node: {}", node);
            }
            if resolved.providers.is_empty() {
                println!("No servers resolved.");
                return Ok(());
            }

            println!("{:<15} | {:<60} | {:<6} | Throughput", "Provider", "URI", "Creds");
            println!("{:-<15}-|-{:-<60}-|-{:-<6}-|-{:-<10}", "", "", "", "");
            for (name, servers) in &resolved.providers {
                for entry in &servers.servers {
                    match entry.descriptor() {
                        Ok(d) => println!(
                            "{:<15} | {:<60} | {:<6} | {}",
                            name,
                            d.uri(),
                            if d.username.is_some() { "yes" } else { "no" },
                            if d.supports_throughput() && servers.do_throughput {
                                "yes"
                            } else {
                                "no"
                            }
                        ),
                        Err(e) => println!(
                            "{:<15} | {:<60} | {:<6} | invalid: {}",
                            name,
                            entry.urls.first().map(String::as_str).unwrap_or_default(),
                            "",
                            e
                        ),
                    }
                }
            }
        }
        Commands::SelfTest { json } => {
            init_tracing(&LoggingConfig::default());
            tracing::info!("Running harness self-test");
            let report = iceperf::selftest::run().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\niceperf Harness Self-Test");
                println!("{:<20} | {:<6} | Details", "Scenario", "Status");
                println!("{:-<20}-|-{:-<6}-|-{:-<40}", "", "", "");
                for check in &report.checks {
                    let status = match check.status {
                        TestStatus::Pass => "PASS",
                        TestStatus::Fail => "FAIL",
                    };
                    println!("{:<20} | {:<6} | {}", check.scenario, status, check.details);
                }
                println!();
                print!("{}", table::render(&report.results));
                println!();
            }
            if !report.passed() {
                anyhow::bail!("self-test failed");
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn print_results(results: &[Stats], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
    } else {
        println!();
        print!("{}", table::render(results));
        println!();
    }
    Ok(())
}
