#![warn(missing_docs)]

//! dsync-repl: runs the replication cycle driver against in-memory collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dirsync_meta::backend::{Backend, MemoryBackend};
use dirsync_meta::directory::{LoopbackConnector, StaticSchema};
use dirsync_meta::types::{
    Entry, ATTR_CN, ATTR_INVOCATION_ID, ATTR_OBJECT_CLASS, ATTR_RAFT_TERM, ATTR_SERVER_ID,
    InvocationId, OC_DIR_SERVER, RAFT_CONTEXT_DN, RAFT_PERSIST_STATE_DN,
};
use dirsync_repl::config::ReplConfig;
use dirsync_repl::context::{Collaborators, ServerContext};
use dirsync_repl::driver::{DriverExit, ReplicationDriver};
use dirsync_repl::rpc::MemoryPartners;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "dsync-repl")]
#[command(about = "dirsync multi-master replication driver", long_about = None)]
struct Cli {
    /// TOML or JSON configuration file
    #[arg(short, long, env = "DSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// One-shot restore: exit after the first completed cycle
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) if path.exists() => ReplConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            ReplConfig::default()
        }
        None => ReplConfig::default(),
    };
    if cli.once {
        config.restore_mode = true;
    }
    config.validate()?;

    let backend = Arc::new(MemoryBackend::new());
    seed_local_directory(&backend, &config)?;

    let ctx = Arc::new(ServerContext::new(
        config,
        Collaborators {
            backend: backend.clone(),
            directory: backend,
            schema: Arc::new(StaticSchema::new([ATTR_RAFT_TERM])),
            nodes: Arc::new(LoopbackConnector::new()),
            partners: Arc::new(MemoryPartners::new()),
        },
    ));
    ctx.init()?;
    tracing::info!(fqdn = %ctx.config.server.fqdn, "dsync-repl starting");

    let gate = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if ctx.wait_first_cycle().await.is_ok() {
                tracing::info!("first replication cycle done, client ports may open");
            }
        })
    };

    let driver = ReplicationDriver::new(ctx.clone());
    let exit = tokio::select! {
        exit = driver.run() => exit?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            ctx.shutdown();
            DriverExit::Shutdown
        }
    };
    ctx.shutdown();
    join_gate(gate).await;

    tracing::info!(exit = ?exit, cycles = ctx.cycle_count(), "dsync-repl stopped");
    tracing::debug!("{}", ctx.metrics.format_prometheus());
    Ok(())
}

/// Waits for the first-cycle gate task; returns false if it panicked or was cancelled.
async fn join_gate(gate: JoinHandle<()>) -> bool {
    match gate.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "first-cycle gate task failed");
            false
        }
    }
}

/// Creates the Raft context and the local server object a promoted node expects.
fn seed_local_directory(backend: &MemoryBackend, config: &ReplConfig) -> Result<()> {
    let Some(domain) = &config.system_domain_dn else {
        return Ok(());
    };
    backend.add_entry(Entry::new(RAFT_CONTEXT_DN))?;
    backend.add_entry(Entry::new(RAFT_PERSIST_STATE_DN))?;

    let invocation = config
        .server
        .invocation_id
        .clone()
        .map(InvocationId::new)
        .unwrap_or_else(InvocationId::generate);
    let servers = format!("cn=Servers,cn={},cn=Sites,cn=Configuration,{}", config.server.site, domain);
    for dn in [
        format!("cn=Configuration,{}", domain),
        format!("cn=Sites,cn=Configuration,{}", domain),
        format!("cn={},cn=Sites,cn=Configuration,{}", config.server.site, domain),
        servers.clone(),
    ] {
        backend.add_entry(Entry::new(dn))?;
    }
    backend.add_entry(
        Entry::new(format!("cn={},{}", config.server.fqdn, servers))
            .with_attr(ATTR_OBJECT_CLASS, OC_DIR_SERVER)
            .with_attr(ATTR_CN, &config.server.fqdn)
            .with_attr(ATTR_INVOCATION_ID, invocation.as_str())
            .with_attr(ATTR_SERVER_ID, &config.server.server_id.to_string()),
    )?;
    Ok(())
}
