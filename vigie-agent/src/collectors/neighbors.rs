//! Neighbour table collector
//!
//! Reads `ip neigh show`, keeps the host inventory in sync and queues one
//! `neighbors` entry per run.
//!
//! Options: `command` (default `ip`), `timeout_secs` (default 10),
//! `include_ipv6` (default false).

use super::{Collector, CollectorContext};
use crate::execution::run_tool;
use crate::queue::HostUpdate;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Neighbor {
    pub ip: String,
    pub mac: String,
    pub device: Option<String>,
    pub state: Option<String>,
}

/// Parses `ip neigh show` output. Entries without a link-layer address
/// (FAILED, INCOMPLETE) are skipped.
pub fn parse_neighbors(output: &str) -> Vec<Neighbor> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let ip = tokens.next()?.to_string();

            let mut mac = None;
            let mut device = None;
            let mut state = None;
            while let Some(token) = tokens.next() {
                match token {
                    "dev" => device = tokens.next().map(str::to_string),
                    "lladdr" => mac = tokens.next().map(|m| m.to_lowercase()),
                    "router" | "proxy" | "extern_learn" => {}
                    other if other.chars().all(|c| c.is_ascii_uppercase()) => {
                        state = Some(other.to_string())
                    }
                    _ => {}
                }
            }

            Some(Neighbor {
                ip,
                mac: mac?,
                device,
                state,
            })
        })
        .collect()
}

pub struct NeighborsCollector;

impl NeighborsCollector {
    async fn collect(&self, ctx: &CollectorContext) -> anyhow::Result<()> {
        let command = ctx.option_str("command", "ip");
        let timeout = ctx.option_secs("timeout_secs", 10);
        let include_ipv6 = ctx.option_bool("include_ipv6", false);

        let output = run_tool(command, ["neigh", "show"], timeout)
            .await?
            .ensure_success(command)?;

        let neighbors: Vec<Neighbor> = parse_neighbors(&output.stdout)
            .into_iter()
            .filter(|n| include_ipv6 || !n.ip.contains(':'))
            .collect();
        debug!("{} neighbours in table", neighbors.len());

        let mut new_hosts = Vec::new();
        let mut changed = Vec::new();
        for neighbor in &neighbors {
            match ctx.find_host(&neighbor.ip)? {
                None => {
                    ctx.put_host(&neighbor.ip, &neighbor.mac)?;
                    new_hosts.push(neighbor.ip.clone());
                }
                Some(host) if host.mac_address.as_deref() != Some(neighbor.mac.as_str()) => {
                    ctx.update_host(&neighbor.ip, &HostUpdate::new().mac_address(neighbor.mac.clone()))?;
                    changed.push(neighbor.ip.clone());
                }
                Some(_) => {}
            }
        }

        if !new_hosts.is_empty() || !changed.is_empty() {
            info!(
                "neighbours: {} new, {} with a new mac",
                new_hosts.len(),
                changed.len()
            );
        }

        ctx.put(
            "neighbors",
            json!({
                "hosts": neighbors,
                "new": new_hosts,
                "changed": changed,
            }),
        )?;
        Ok(())
    }
}

impl Collector for NeighborsCollector {
    fn kind(&self) -> &'static str {
        "neighbors"
    }

    fn run<'a>(&'a self, ctx: &'a CollectorContext) -> BoxFuture<'a, anyhow::Result<()>> {
        self.collect(ctx).boxed()
    }
}
