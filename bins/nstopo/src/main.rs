//! nstopo - watch namespaces, bridges and veth pairs.

mod output;
mod repl;
mod replay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nstopo::events::parse_kinds;
use nstopo::monitor::Monitor;
use nstopo::netlink::NetlinkProbe;
use nstopo::watcher::NamespaceWatcher;
use nstopo::{NamespaceLifecycle, NotificationHub, Topology, TopologyConfig};

#[derive(Parser)]
#[command(name = "nstopo", version, about = "Network namespace topology monitor")]
struct Cli {
    /// Stream notifications as JSON lines.
    #[arg(short = 'e', long)]
    events: bool,

    /// Only stream these kinds (e.g. namespace.connect, veth.*).
    #[arg(long, value_name = "KIND", num_args = 1..)]
    subscribe: Vec<String>,

    /// Send the stream to a TCP peer instead of stdout.
    #[arg(short = 'c', long, value_name = "ADDR")]
    connect: Option<String>,

    /// JSON configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Extra named namespaces to monitor from the start.
    #[arg(long, value_name = "NAME", num_args = 1..)]
    netns: Vec<String>,

    /// Don't follow /var/run/netns.
    #[arg(long)]
    no_watch: bool,

    /// Apply a JSON-lines update script instead of reading the kernel.
    #[arg(long, value_name = "PATH")]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries JSON only.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TopologyConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TopologyConfig::default(),
    };
    config.validate()?;

    let hub = Arc::new(NotificationHub::new());
    let kinds = if cli.subscribe.is_empty() {
        None
    } else {
        Some(parse_kinds(&cli.subscribe)?)
    };
    let stream = if cli.events || kinds.is_some() || cli.connect.is_some() {
        let writer = output::open(cli.connect.as_deref()).await?;
        let (id, rx) = hub.channel(kinds, config.event_queue_capacity);
        Some((id, tokio::spawn(output::forward(rx, writer))))
    } else {
        None
    };

    match &cli.replay {
        Some(script) => {
            let topology = replay::run(script, config, hub.clone())
                .await
                .with_context(|| format!("replaying {}", script.display()))?;
            repl::run(&topology).await?;
            for name in topology.namespace_names() {
                topology.delete_namespace(&name).await;
            }
        }
        None => {
            let monitor = start_live(&cli, config, hub.clone()).await?;
            tokio::select! {
                exit = repl::run(monitor.topology()) => {
                    if exit? == repl::Exit::EndOfInput {
                        // Detached from a terminal: keep monitoring.
                        tokio::signal::ctrl_c().await?;
                    }
                }
                signal = tokio::signal::ctrl_c() => signal?,
            }
            monitor.shutdown().await;
        }
    }

    // Closing the channel lets the writer drain what is still queued.
    if let Some((id, writer)) = stream {
        hub.unsubscribe(id);
        writer.await?;
    }
    Ok(())
}

async fn start_live(
    cli: &Cli,
    config: TopologyConfig,
    hub: Arc<NotificationHub>,
) -> anyhow::Result<Arc<Monitor>> {
    let probe = Arc::new(NetlinkProbe::new());
    let topology = Topology::new(config, hub, probe.clone());
    let monitor = Arc::new(Monitor::new(topology, probe)?);

    monitor
        .start_default()
        .await
        .context("cannot subscribe to the default namespace")?;

    for name in &cli.netns {
        monitor
            .handle_lifecycle(&NamespaceLifecycle::start(name.clone()))
            .await;
    }

    if !cli.no_watch {
        match NamespaceWatcher::list_and_watch() {
            Ok((existing, watcher)) => {
                for name in existing {
                    monitor.handle_lifecycle(&NamespaceLifecycle::start(name)).await;
                }
                tokio::spawn(watch(watcher, monitor.clone()));
            }
            Err(e) => tracing::warn!(error = %e, "namespace directory not watched"),
        }
    }

    Ok(monitor)
}

async fn watch(mut watcher: NamespaceWatcher, monitor: Arc<Monitor>) {
    loop {
        match watcher.recv().await {
            Ok(Some(event)) => monitor.handle_lifecycle(&event).await,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "namespace watcher failed");
                break;
            }
        }
    }
}
