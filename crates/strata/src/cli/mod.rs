mod init;
mod migrate;

pub use init::InitCommand;
pub use migrate::MigrateCommand;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// STRATA - PostgreSQL schema migrations
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a strata.toml and migrations directory.
    Init(InitCommand),

    /// Manage database migrations.
    Migrate(MigrateCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Init(cmd) => cmd.execute(),
            Commands::Migrate(cmd) => cmd.execute().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrate::MigrateAction;

    #[test]
    fn test_cli_parse_init() {
        let cli = Cli::try_parse_from(["strata", "init"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_up_flags() {
        let cli =
            Cli::try_parse_from(["strata", "migrate", "up", "--ignore-missing", "--timeout", "30"])
                .unwrap();
        match cli.command {
            Commands::Migrate(cmd) => match cmd.action {
                MigrateAction::Up {
                    ignore_missing,
                    timeout,
                } => {
                    assert!(ignore_missing);
                    assert_eq!(timeout, Some(30));
                }
                _ => panic!("expected up"),
            },
            _ => panic!("expected migrate"),
        }
    }

    #[test]
    fn test_cli_parse_down_defaults_to_one_step() {
        let cli = Cli::try_parse_from(["strata", "migrate", "down"]).unwrap();
        let Commands::Migrate(cmd) = cli.command else {
            panic!("expected migrate");
        };
        let MigrateAction::Down { count, to, all } = cmd.action else {
            panic!("expected down");
        };
        assert_eq!(count, 1);
        assert!(to.is_none());
        assert!(!all);
    }

    #[test]
    fn test_cli_parse_down_targets_conflict() {
        assert!(Cli::try_parse_from(["strata", "migrate", "down", "--to", "0002_posts"]).is_ok());
        assert!(Cli::try_parse_from(["strata", "migrate", "down", "--all"]).is_ok());
        assert!(
            Cli::try_parse_from(["strata", "migrate", "down", "--all", "--to", "0002_posts"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["strata", "migrate", "down", "2", "--all"]).is_err());
    }

    #[test]
    fn test_cli_parse_global_options() {
        let cli = Cli::try_parse_from([
            "strata",
            "migrate",
            "status",
            "--json",
            "--config",
            "db/strata.toml",
            "--migrations-dir",
            "db/migrations",
        ])
        .unwrap();
        let Commands::Migrate(cmd) = cli.command else {
            panic!("expected migrate");
        };
        assert_eq!(cmd.config, "db/strata.toml");
        assert_eq!(cmd.migrations_dir.as_deref(), Some("db/migrations"));
        assert!(matches!(cmd.action, MigrateAction::Status { json: true }));
    }

    #[test]
    fn test_cli_parse_rejects_unknown_action() {
        assert!(Cli::try_parse_from(["strata", "migrate", "sideways"]).is_err());
    }
}
