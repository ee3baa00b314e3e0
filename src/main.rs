// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Medtrace command line: run a traced demo workload or inspect configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use medtrace::attributes;
use medtrace::config::{self, TelemetryConfiguration};
use medtrace::logging::{init_logging, LogConfig};
use medtrace::telemetry::{HealthcareContext, PhiDataLevel, SpanKind, TelemetrySystem};

/// Medtrace - distributed tracing for clinical services.
#[derive(Parser)]
#[command(name = "medtrace")]
#[command(author, version, about = "Distributed tracing for clinical services", long_about = None)]
struct Cli {
    /// Show debug diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sample checkout and patient-record workload and export its spans
    Demo(DemoArgs),

    /// Print the resolved configuration
    Config {
        /// Config file to use instead of searching the current directory
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct DemoArgs {
    /// Config file to use instead of searching the current directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Jaeger collector base URL (export goes there in production)
    #[arg(long, env = "MEDTRACE_JAEGER_ENDPOINT")]
    jaeger: Option<String>,

    /// Deployment environment
    #[arg(short, long)]
    environment: Option<String>,

    /// Fraction of spans to record, 0.0 to 1.0
    #[arg(short, long)]
    sampling_rate: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
#[error("payment declined: {0}")]
struct PaymentDeclined(String);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::development()
    } else {
        LogConfig::default()
    };
    let _guard = init_logging(&log_config).context("failed to initialize logging")?;

    match cli.command {
        Commands::Demo(args) => run_demo(args).await,
        Commands::Config { config } => show_config(config),
    }
}

fn resolve_config(explicit: Option<PathBuf>) -> anyhow::Result<TelemetryConfiguration> {
    let workspace_root = std::env::current_dir()?;
    let config = config::load_config(&workspace_root, explicit.as_deref())?;
    Ok(config)
}

fn print_warnings(config: &TelemetryConfiguration) {
    for warning in config.validate() {
        eprintln!("{} {}", "warning:".yellow().bold(), warning);
    }
}

fn show_config(explicit: Option<PathBuf>) -> anyhow::Result<()> {
    let config = resolve_config(explicit)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    print_warnings(&config);
    Ok(())
}

async fn run_demo(args: DemoArgs) -> anyhow::Result<()> {
    let mut config = resolve_config(args.config)?;
    if let Some(endpoint) = args.jaeger {
        config.jaeger_endpoint = Some(endpoint);
    }
    if let Some(environment) = args.environment {
        config.environment = environment;
    }
    if let Some(rate) = args.sampling_rate {
        config.sampling_rate = rate;
    }
    print_warnings(&config);

    let telemetry = TelemetrySystem::new(config);
    println!(
        "{} {} ({}, sink: {})",
        "Tracing".bright_blue().bold(),
        telemetry.config().service_name.bright_white(),
        telemetry.config().environment,
        telemetry.exporter_name()
    );

    checkout(&telemetry).await;
    patient_lookup(&telemetry).await;

    telemetry.shutdown().await;

    println!("{}", "✓ Demo complete".green());
    println!("\n{}", telemetry.stats().format_report());
    Ok(())
}

/// A checkout request whose payment call fails once and then succeeds.
async fn checkout(telemetry: &TelemetrySystem) {
    let inner = telemetry.clone();
    let result = telemetry
        .with_telemetry("checkout", SpanKind::Server, |span| async move {
            span.set_attributes(attributes! { "cart.items" => 3, "cart.total" => 59.97 });

            let declined = inner
                .with_telemetry("payment", SpanKind::Client, |span| async move {
                    span.set_attribute("payment.attempt", 1);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    Err::<(), _>(PaymentDeclined("issuer unavailable".to_string()))
                })
                .await;
            if let Err(e) = declined {
                span.add_event_with("payment_retry", attributes! { "reason" => e.to_string() });
            }

            let db = inner.clone();
            inner
                .with_telemetry("payment", SpanKind::Client, |span| async move {
                    span.set_attribute("payment.attempt", 2);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    db.record_database_query(Duration::from_millis(4));
                    Ok::<_, PaymentDeclined>("auth-7731")
                })
                .await
        })
        .await;

    match result {
        Ok(auth) => println!("  checkout authorized ({})", auth.bright_white()),
        Err(e) => println!("  checkout failed: {}", e.to_string().red()),
    }
}

/// A chart read with a compliance check and an AI-assisted triage decision.
async fn patient_lookup(telemetry: &TelemetrySystem) {
    telemetry.set_current_context(None);

    let access = telemetry.trace_phi_data_access("chart_read", "patient-1042", "vitals", "treatment");
    access.record_compliance_checkpoint("minimum_necessary", true, None);
    tokio::time::sleep(Duration::from_millis(5)).await;
    telemetry.finish_span(&access);

    let hc = HealthcareContext::new(PhiDataLevel::Limited)
        .with_patient("patient-1042")
        .with_workflow("ed-triage")
        .with_flag("HIPAA")
        .decision_point();
    let inner = telemetry.clone();
    let triage = telemetry
        .with_healthcare_telemetry("triage_model", hc, |span| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            inner.record_ai_operation(Duration::from_millis(10), None, Some(412));
            span.record_clinical_decision("acuity", "esi-3", Some(0.87));
            Ok::<_, anyhow::Error>("esi-3")
        })
        .await;

    match triage {
        Ok(level) => println!("  triage recorded ({})", level.bright_white()),
        Err(e) => println!("  triage failed: {}", e.to_string().red()),
    }
}
