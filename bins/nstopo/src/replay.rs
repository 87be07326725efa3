//! Replay of recorded updates.
//!
//! A script is JSON lines, applied in order:
//!
//! ```text
//! {"kind":"start","name":"ns1"}
//! {"namespace":"ns1","update":{"type":"link","kind":"new","index":10,"name":"br0","device_type":"bridge","full":true}}
//! {"sleep_ms":50}
//! {"kind":"destroy","name":"ns1"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Link updates also
//! feed the probe used for veth peer lookups, so pairing behaves as it
//! would against the kernel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nstopo::probe::{ProbedLink, StaticProbe};
use nstopo::update::{LifecycleKind, UpdateKind};
use nstopo::{NamespaceLifecycle, NotificationHub, Topology, TopologyConfig, TopologyUpdate};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ScriptLine {
    Update {
        namespace: String,
        update: TopologyUpdate,
    },
    Lifecycle(NamespaceLifecycle),
    Sleep {
        sleep_ms: u64,
    },
}

pub fn parse_script(text: &str) -> anyhow::Result<Vec<ScriptLine>> {
    let mut lines = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = serde_json::from_str(line)
            .with_context(|| format!("line {}: not a script line", number + 1))?;
        lines.push(parsed);
    }
    Ok(lines)
}

/// Build a topology by applying the script at `path`.
///
/// The default namespace exists before the first line runs.
pub async fn run(
    path: &Path,
    config: TopologyConfig,
    hub: Arc<NotificationHub>,
) -> anyhow::Result<Arc<Topology>> {
    let text = tokio::fs::read_to_string(path).await?;
    let script = parse_script(&text)?;

    let probe = Arc::new(StaticProbe::new());
    let topology = Topology::new(config, hub, probe.clone());
    topology.default_namespace();

    for line in script {
        apply(&topology, &probe, line).await;
    }
    Ok(topology)
}

async fn apply(topology: &Topology, probe: &StaticProbe, line: ScriptLine) {
    match line {
        ScriptLine::Update { namespace, update } => {
            if let TopologyUpdate::Link(link) = &update
                && link.full
            {
                match link.kind {
                    UpdateKind::New => probe.insert(&namespace, ProbedLink::from(link)),
                    UpdateKind::Delete => {
                        probe.remove(&namespace, link.index);
                    }
                }
            }
            topology.apply(&namespace, &update).await;
        }
        ScriptLine::Lifecycle(event) => match event.kind {
            LifecycleKind::Start => {
                topology.create_namespace(&event.name);
            }
            LifecycleKind::Destroy => {
                probe.clear_namespace(&event.name);
                topology.delete_namespace(&event.name).await;
            }
        },
        ScriptLine::Sleep { sleep_ms } => {
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }
}
