// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waypoint operator tool.
//!
//! - `status`: state summary and instance list of the configured store
//! - `check-signatures`: compare two exported version signatures before a
//!   deployment

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use waypoint_core::config::Config;
use waypoint_core::persistence::{InstanceFilter, InstanceState, SqlitePersistence};
use waypoint_core::{CompatibilityChecker, Monitor, VersionSignature};

#[derive(Parser, Debug)]
#[command(name = "waypoint-core")]
#[command(about = "Waypoint durable workflow engine tooling", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show instance counts per state and the instance list
    Status {
        /// Only list instances in this state (e.g. WAITING)
        #[arg(short, long)]
        state: Option<InstanceState>,

        /// Only list instances of this processor pool
        #[arg(short, long)]
        pool: Option<String>,

        /// Only list instances of this workflow alias
        #[arg(short, long)]
        alias: Option<String>,

        /// Maximum number of instances to list
        #[arg(short, long, default_value_t = 50)]
        limit: i64,

        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Check whether continuations captured under OLD can resume under NEW
    CheckSignatures {
        /// Signature JSON of the deployed version
        old: PathBuf,

        /// Signature JSON of the candidate version
        new: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("waypoint_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().command {
        Command::Status {
            state,
            pool,
            alias,
            limit,
            json,
        } => {
            status(
                InstanceFilter {
                    state,
                    pool_id: pool,
                    alias,
                    limit: Some(limit),
                    ..Default::default()
                },
                json,
            )
            .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckSignatures { old, new } => check_signatures(&old, &new),
    }
}

async fn status(filter: InstanceFilter, json: bool) -> Result<()> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!("Connecting to database...");
    let persistence = SqlitePersistence::connect(&config.database_url).await?;
    let monitor = Monitor::new(Arc::new(persistence));

    let summary = monitor.state_summary().await?;
    let instances = monitor.list(&filter).await?;

    if json {
        let out = serde_json::json!({
            "summary": summary,
            "instances": instances,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for (state, count) in &summary.counts {
        println!("{:<10} {:>6}", state, count);
    }
    println!("{:<10} {:>6}", "TOTAL", summary.total());
    println!();
    println!(
        "{:<36}  {:<16} {:<10} {:<9} {:>4}  {:<12} WAIT DEADLINE",
        "INSTANCE", "ALIAS", "VERSION", "STATE", "PRIO", "POOL"
    );
    for view in instances {
        println!(
            "{:<36}  {:<16} {:<10} {:<9} {:>4}  {:<12} {}",
            view.instance_id,
            view.alias,
            view.version,
            view.state,
            view.priority,
            view.pool_id,
            view.wait_deadline
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn check_signatures(old: &Path, new: &Path) -> Result<ExitCode> {
    let old = read_signature(old)?;
    let new = read_signature(new)?;
    let report = CompatibilityChecker::report(&old, &new);

    if report.is_compatible() {
        println!(
            "{} {} -> {}: compatible",
            report.alias, report.from, report.to
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{} {} -> {}: INCOMPATIBLE",
        report.alias, report.from, report.to
    );
    for problem in &report.incompatibilities {
        println!("  - {}", problem);
    }
    Ok(ExitCode::FAILURE)
}

fn read_signature(path: &Path) -> Result<VersionSignature> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a version signature", path.display()))
}
