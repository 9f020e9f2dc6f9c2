use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tilehost::config::ServerConfig;
use tilehost::logging::{setup_logging, LoggingOverrides};
use tilehost::privileges::{apply_umask, daemonize, drop_privileges, PidFile};
use tilehost::signals::spawn_shutdown_on_signal;
use tilehost::TilehostServer;

/// Hosts terminal games for browser clients.
#[derive(Debug, Parser)]
#[command(name = "tilehost", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "tilehost.toml")]
    config: PathBuf,

    /// Log filter, overriding `[logging] level`.
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON.
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.check {
        println!(
            "{}: ok ({} games, {} listeners)",
            cli.config.display(),
            config.games().len(),
            config.endpoints().len()
        );
        return Ok(());
    }

    // Forking is only sound while the process is single-threaded.
    if config.process.daemon {
        daemonize()?;
    }
    setup_logging(
        &config.logging,
        &LoggingOverrides {
            level: cli.log_level.clone(),
            json: cli.json_logs,
        },
    )?;
    if let Some(mask) = config.process.umask {
        apply_umask(mask);
    }
    let mut pidfile = config.process.pidfile.as_deref().map(PidFile::create).transpose()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;

    runtime.block_on(async move {
        let process = config.process.clone();
        let server = TilehostServer::builder(config).build().await?;
        drop_privileges(&process, pidfile.as_mut())?;
        spawn_shutdown_on_signal(server.shutdown_handle())?;
        server.run().await?;
        drop(pidfile);
        Ok::<_, anyhow::Error>(())
    })
}
