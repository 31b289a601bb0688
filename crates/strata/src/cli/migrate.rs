use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::Path;

use strata::{MigrationStatus, RevertTarget, Strata, StrataConfig, StrataError};

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "strata.toml", global = true)]
    pub config: String,

    /// Migrations directory path (overrides config).
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Run all pending migrations.
    Up {
        /// Apply even if recorded migrations have no matching files.
        #[arg(long)]
        ignore_missing: bool,

        /// Abort the run after this many seconds.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Revert applied migrations, newest first.
    Down {
        /// Number of migrations to revert.
        #[arg(default_value_t = 1, conflicts_with_all = ["to", "all"])]
        count: usize,

        /// Revert every migration down to and including this one.
        #[arg(long, value_name = "ID", conflicts_with = "all")]
        to: Option<String>,

        /// Revert every applied migration.
        #[arg(long)]
        all: bool,
    },

    /// Show migration status.
    Status {
        /// Print status as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List recorded migrations whose files are gone. Exits non-zero if any.
    Drift,

    /// List migrations that have not been applied.
    Pending,
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        // Load .env if present
        dotenvy::dotenv().ok();

        let mut config = self.load_config()?;
        if let MigrateAction::Up {
            ignore_missing,
            timeout,
        } = &self.action
        {
            if *ignore_missing {
                config.migrations.ignore_missing_migrations = true;
            }
            if timeout.is_some() {
                config.migrations.run_timeout_secs = *timeout;
            }
        }

        strata::init_tracing(&config.logging);

        let json_output = matches!(self.action, MigrateAction::Status { json: true });
        if !json_output {
            banner();
        }

        let strata = Strata::builder().config(config).connect().await?;
        let outcome = run_action(&strata, self.action).await;
        strata.close().await;
        outcome
    }

    fn load_config(&self) -> Result<StrataConfig> {
        let config_path = Path::new(&self.config);
        let mut config = if config_path.exists() {
            StrataConfig::from_file(config_path)?
        } else if let Ok(url) = std::env::var("DATABASE_URL") {
            StrataConfig::default_with_database_url(&url)
        } else {
            anyhow::bail!(
                "Configuration file not found: {}\nRun `strata init` to create one, or set DATABASE_URL.",
                self.config
            );
        };

        if let Some(dir) = &self.migrations_dir {
            config.migrations.dir = dir.into();
        }
        Ok(config)
    }
}

fn banner() {
    println!();
    println!(
        "  {}  {} Migrations",
        style("▤").bold(),
        style("STRATA").bold().cyan()
    );
    println!();
}

async fn run_action(strata: &Strata, action: MigrateAction) -> Result<()> {
    match action {
        MigrateAction::Up { .. } => {
            println!("  {} Running pending migrations...", style("→").dim());
            let result = match strata.up().await {
                Ok(result) => result,
                Err(e) => {
                    report_partial(&e, "Applied");
                    return Err(e.into());
                }
            };

            if result.is_empty() {
                println!("  {} Database is up to date", style("ℹ").blue());
            } else {
                for id in &result.migrations {
                    println!("  {} Applied: {}", style("✓").green(), id);
                }
                println!();
                println!(
                    "  {} Applied {} migration(s)",
                    style("✓").green(),
                    result.len()
                );
            }
            println!();
        }

        MigrateAction::Down { count, to, all } => {
            let target = if all {
                RevertTarget::All
            } else if let Some(id) = to {
                RevertTarget::Through(id.into())
            } else {
                if count == 0 {
                    println!("  {} Nothing to revert (count=0)", style("ℹ").blue());
                    return Ok(());
                }
                RevertTarget::Steps(count)
            };

            println!("  {} Reverting migrations...", style("→").dim());
            let result = match strata.revert(target).await {
                Ok(result) => result,
                Err(e) => {
                    report_partial(&e, "Reverted");
                    return Err(e.into());
                }
            };

            if result.is_empty() {
                println!("  {} No migrations to revert", style("ℹ").blue());
            } else {
                for id in &result.migrations {
                    println!("  {} Reverted: {}", style("✓").green(), id);
                }
                println!();
                println!(
                    "  {} Reverted {} migration(s)",
                    style("✓").green(),
                    result.len()
                );
            }
            println!();
        }

        MigrateAction::Status { json } => {
            let status = strata.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        MigrateAction::Drift => {
            let missing = strata.check_drift().await?;
            if missing.is_empty() {
                println!("  {} No drift detected", style("✓").green());
                println!();
                return Ok(());
            }

            println!("  {} Missing migration files:", style("✗").red());
            for id in &missing {
                println!("    {} {}", style("→").dim(), style(id).red());
            }
            println!();
            anyhow::bail!(
                "{} recorded migration(s) have no matching files; you probably need to downgrade",
                missing.len()
            );
        }

        MigrateAction::Pending => {
            let pending = strata.pending().await?;
            if pending.is_empty() {
                println!("  {} No pending migrations", style("ℹ").blue());
            } else {
                println!("  {} Pending:", style("○").yellow());
                for id in &pending {
                    println!("    {} {}", style("→").dim(), style(id).yellow());
                }
            }
            println!();
        }
    }

    Ok(())
}

/// Show the units a failed run finished before stopping.
fn report_partial(error: &StrataError, verb: &str) {
    for id in error.completed() {
        println!("  {} {}: {}", style("✓").green(), verb, id);
    }
    println!("  {} {}", style("✗").red(), error);
    println!();
}

fn print_status(status: &MigrationStatus) {
    if status.applied.is_empty() && status.pending.is_empty() {
        println!("  {} No migrations found", style("ℹ").blue());
        println!();
        return;
    }

    if !status.applied.is_empty() {
        println!("  {} Applied:", style("✓").green());
        for m in &status.applied {
            let marker = if !m.present {
                style("✗").red().to_string()
            } else if m.has_down {
                style("↓").green().to_string()
            } else {
                style("-").dim().to_string()
            };
            println!(
                "    {} {} {} ({})",
                marker,
                style(&m.id).cyan(),
                style("at").dim(),
                m.applied_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    if !status.pending.is_empty() {
        if !status.applied.is_empty() {
            println!();
        }
        println!("  {} Pending:", style("○").yellow());
        for id in &status.pending {
            println!("    {} {}", style("→").dim(), style(id).yellow());
        }
    }

    println!();
    println!(
        "  {} {} applied, {} pending, {} missing",
        style("ℹ").blue(),
        status.applied.len(),
        status.pending.len(),
        status.missing.len()
    );
    println!();

    println!(
        "  {} = has down migration, {} = no down migration, {} = file missing",
        style("↓").green(),
        style("-").dim(),
        style("✗").red()
    );
    println!();
}
