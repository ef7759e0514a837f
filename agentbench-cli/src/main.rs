// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Agentbench CLI
//!
//! Generates and validates task configurations, runs the configured tasks
//! and writes the JSON results plus CSV/HTML reports.

mod config;
mod report;
mod tasks;

use agentbench_evals::metrics::{requires_judge, METRIC_NAMES};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{BenchConfig, TEMPLATE};
use report::{RunResults, TaskStatus};
use std::path::PathBuf;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "agentbench")]
#[command(about = "Agentbench - agent trace evaluation", long_about = None)]
struct Cli {
    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Task configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Run every configured task
    Run {
        /// Path to the task configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Run tasks one after another
        #[arg(long)]
        sequential: bool,
    },

    /// List available metrics
    Info,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a commented template configuration
    Generate {
        #[arg(short, long, default_value = "agentbench.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Check a configuration without running it
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Config { command } => handle_config_command(command),
        Commands::Run { config, sequential } => {
            let all_succeeded = run(config, sequential).await?;
            if !all_succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Info => {
            println!("Available metrics:");
            for name in METRIC_NAMES {
                let note = if requires_judge(name) { " (requires [judge])" } else { "" };
                println!("  {}{}", name, note);
            }
            Ok(())
        }
    }
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Generate { output, force } => {
            if output.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", output);
            }
            std::fs::write(&output, TEMPLATE).with_context(|| format!("Failed to write {:?}", output))?;
            println!("✓ Wrote template configuration to {:?}", output);
        }
        ConfigCommands::Validate { config } => {
            if !config.exists() {
                anyhow::bail!("Config file not found: {:?}", config);
            }
            let bench = BenchConfig::load(Some(config.clone()))?;
            bench.validate()?;
            println!("✓ {:?} is valid ({} tasks)", config, bench.tasks.len());
        }
    }
    Ok(())
}

/// Runs every task; true when all of them succeeded
async fn run(config_path: PathBuf, sequential: bool) -> Result<bool> {
    if !config_path.exists() {
        anyhow::bail!("Config file not found: {:?}", config_path);
    }
    let config = BenchConfig::load(Some(config_path))?;
    config.validate()?;

    let judge = tasks::build_judge(config.judge.as_ref())?;
    let parallel = config.execution.parallel && !sequential;
    info!(
        "Running {} tasks ({})",
        config.tasks.len(),
        if parallel { "parallel" } else { "sequential" }
    );

    let started_at = Utc::now();
    let results = if parallel {
        futures::future::join_all(
            config
                .tasks
                .iter()
                .map(|task| tasks::run_task(&config, task, judge.clone())),
        )
        .await
    } else {
        let mut results = Vec::with_capacity(config.tasks.len());
        for task in &config.tasks {
            results.push(tasks::run_task(&config, task, judge.clone()).await);
        }
        results
    };

    let run = RunResults {
        started_at,
        finished_at: Utc::now(),
        tasks: results,
    };
    run.write_json(&config.output.results_path)?;
    run.write_reports(&config.output.report_dir)?;

    for task in &run.tasks {
        match task.status {
            TaskStatus::Success => println!(
                "✓ {}: {} units, pass rate {:.2}, cost ${:.4}",
                task.name, task.total_units, task.pass_rate, task.total_cost
            ),
            TaskStatus::Failed => println!(
                "✗ {}: {}",
                task.name,
                task.error.as_deref().unwrap_or("failed")
            ),
        }
    }
    println!("Results written to {:?}", config.output.results_path);

    Ok(run.all_succeeded())
}
