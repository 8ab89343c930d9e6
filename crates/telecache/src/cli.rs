//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use telecache_service::caching::{self, DiskCache};
use telecache_service::config::Config;
use telecache_service::metrics;

use crate::logging;
use crate::server;

/// Telecache commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Remove expired objects from the cache, and evict the oldest ones while it is over its
    /// size limit.
    Cleanup {
        /// Only log what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove all cached objects.
    ClearCache,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "telecache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        session_mode: sentry::SessionMode::Request,
        auto_session_tracking: false,
        ..Default::default()
    });

    // SAFETY: no other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags);
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Cleanup { dry_run } => {
            caching::cleanup(config, dry_run).context("failed to clean up the cache")?
        }
        Command::ClearCache => {
            let cache = DiskCache::from_config(&config).context("failed to open the cache")?;
            cache.clear_all().context("failed to clear the cache")?;
            tracing::info!(cache_dir = %cache.cache_dir().display(), "Cleared the cache");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_cleanup() {
        let cli = Cli::try_parse_from(["telecache", "cleanup", "--dry-run", "-c", "telecache.yml"])
            .unwrap();
        assert!(matches!(cli.command, Command::Cleanup { dry_run: true }));
        assert_eq!(cli.config(), Some(Path::new("telecache.yml")));

        let cli = Cli::try_parse_from(["telecache", "clear-cache"]).unwrap();
        assert!(matches!(cli.command, Command::ClearCache));
        assert_eq!(cli.config(), None);
    }
}
