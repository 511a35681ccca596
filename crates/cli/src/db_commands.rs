use std::path::PathBuf;

use {
    anyhow::Context,
    clap::Subcommand,
    codehost_hosts::SqliteHostStore,
};

use crate::Settings;

#[derive(Subcommand)]
pub enum DbAction {
    /// Delete the database file completely.
    Reset,
    /// Delete every host record but keep the schema intact.
    Clear,
    /// Run all pending database migrations.
    Migrate,
}

pub async fn handle_db(action: DbAction, settings: &Settings) -> anyhow::Result<()> {
    match action {
        DbAction::Reset => reset_database(&settings.database_url),
        DbAction::Clear => {
            let store = open_store(&settings.database_url).await?;
            let removed = store.clear().await?;
            println!("Deleted {removed} host record(s).");
            Ok(())
        },
        DbAction::Migrate => {
            open_store(&settings.database_url).await?;
            println!("Migrations applied.");
            Ok(())
        },
    }
}

/// Connect (creating the file's parent directory when needed) and migrate.
pub async fn open_store(database_url: &str) -> anyhow::Result<SqliteHostStore> {
    if let Some(path) = sqlite_path(database_url)
        && let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    SqliteHostStore::new(database_url)
        .await
        .with_context(|| format!("failed to open database {database_url}"))
}

/// File behind a `sqlite:` URL; `None` for in-memory or non-sqlite URLs.
fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url.strip_prefix("sqlite:")?;
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

fn reset_database(database_url: &str) -> anyhow::Result<()> {
    let Some(db) = sqlite_path(database_url) else {
        anyhow::bail!("{database_url} is not a sqlite database file");
    };

    let mut deleted = false;
    // Also delete WAL and SHM files that SQLite may have created.
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db.clone().into_os_string();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_file(&path)?;
            println!("Deleted: {}", path.display());
            deleted = true;
        }
    }

    if deleted {
        println!("Database files deleted. Run `codehost db migrate` to recreate them.");
    } else {
        println!("No database files found.");
    }
    Ok(())
}
