use anyhow::Result;
use clap::Parser;
use console::style;
use std::fs;
use std::path::Path;

const CONFIG_TEMPLATE: &str = r#"[database]
url = "${DATABASE_URL}"
pool_size = 5

[migrations]
dir = "migrations"
table = "_migrations"
pattern = '\.sql$'
ignore_missing_migrations = false
lock = true

[logging]
level = "info"
json_format = false
"#;

const FIRST_MIGRATION: &str = "-- migrate:up\nCREATE TABLE example (\n    id BIGSERIAL PRIMARY KEY\n);\n\n-- migrate:down\nDROP TABLE example;\n";

/// Create a strata.toml and migrations directory.
#[derive(Parser)]
pub struct InitCommand {
    /// Directory to initialize (defaults to the current one).
    #[arg(default_value = ".")]
    pub path: String,

    /// Also write an example first migration.
    #[arg(long)]
    pub example: bool,
}

impl InitCommand {
    pub fn execute(self) -> Result<()> {
        let root = Path::new(&self.path);
        let created = init_project(root, self.example)?;

        for path in &created {
            println!("  {} Created {}", style("✓").green(), path);
        }
        if created.is_empty() {
            println!("  {} Already initialized", style("ℹ").blue());
        }
        Ok(())
    }
}

/// Write missing project files under `root`. Existing files are left untouched.
fn init_project(root: &Path, example: bool) -> Result<Vec<String>> {
    let mut created = Vec::new();

    let config_path = root.join("strata.toml");
    if !config_path.exists() {
        fs::create_dir_all(root)?;
        fs::write(&config_path, CONFIG_TEMPLATE)?;
        created.push(config_path.display().to_string());
    }

    let migrations_dir = root.join("migrations");
    if !migrations_dir.exists() {
        fs::create_dir_all(&migrations_dir)?;
        created.push(migrations_dir.display().to_string());
    }

    if example {
        let first = migrations_dir.join("0001_example.sql");
        if !first.exists() {
            fs::write(&first, FIRST_MIGRATION)?;
            created.push(first.display().to_string());
        }
    }

    Ok(created)
}
