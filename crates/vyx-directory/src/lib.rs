//! Exchange endpoint discovery and selection.
//!
//! Before each connection attempt the agent fetches the live server list
//! from the exchange API, filters out unhealthy and overloaded entries,
//! probes TCP latency to the survivors, and picks the best weighted
//! combination of load and latency. Every failure path degrades to a
//! static fallback address; selection itself never fails.
//!
//! The weighting biases toward load over raw RTT: load predicts queueing
//! at the server, while RTT self-corrects once the session is warm.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Total deadline for the server-list fetch.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-candidate TCP probe deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Latency charged to candidates whose probe fails.
const PROBE_FAILURE_MS: u64 = 5000;
/// Utilization above which a candidate is not worth probing.
const OVERLOAD_THRESHOLD: f64 = 90.0;

/// One exchange server as reported by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub region: String,
    pub address: String,
    pub status: String,
    #[serde(default)]
    pub connections: ConnectionStats,
}

/// Load figures for one server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionStats {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub maximum: i64,
    #[serde(default)]
    pub available: i64,
    #[serde(default)]
    pub utilization_percent: f64,
}

#[derive(Debug, Deserialize)]
struct ServerListResponse {
    servers: Vec<ServerInfo>,
}

/// Discovery errors. All of them are recoverable by falling back to the
/// static endpoint; they exist for logging, not control flow.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("server list fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("server list API returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("server list is empty")]
    Empty,
}

/// Fetch the candidate list from `{api_base}/api/servers`.
pub async fn discover_servers(api_base: &str) -> Result<Vec<ServerInfo>, DirectoryError> {
    let client = reqwest::Client::builder()
        .timeout(DISCOVERY_TIMEOUT)
        .build()?;

    let response = client.get(format!("{api_base}/api/servers")).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(DirectoryError::Status(status));
    }

    let list: ServerListResponse = response.json().await?;
    if list.servers.is_empty() {
        return Err(DirectoryError::Empty);
    }

    debug!(count = list.servers.len(), "discovered exchange servers");
    Ok(list.servers)
}

/// Probe TCP latency to a candidate.
///
/// Dials `host:443` rather than the session port: the session port is
/// UDP-only and cannot be probed with a TCP connect.
pub async fn probe_latency(address: &str) -> Duration {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _)| host);
    let probe_addr = format!("{host}:443");

    let start = Instant::now();
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&probe_addr)).await {
        Ok(Ok(_)) => start.elapsed(),
        _ => Duration::from_millis(PROBE_FAILURE_MS),
    }
}

/// Weighted score; lower is better. Load 60 %, latency 40 % (normalized
/// so ~1000 ms lands in the same 0–100 range as utilization).
fn score(utilization_percent: f64, latency_ms: u64) -> f64 {
    utilization_percent * 0.6 + (latency_ms as f64 / 10.0) * 0.4
}

/// Pick the index of the best candidate from pre-probed inputs.
///
/// Ties resolve to the earlier position, which is the API's response
/// order. Pure so the ranking is testable without sockets.
fn rank(candidates: &[(f64, u64)]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &(util, latency_ms)) in candidates.iter().enumerate() {
        let s = score(util, latency_ms);
        match best {
            Some((_, current)) if s >= current => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

/// Healthy subset of the server list; falls back to the full list when
/// nothing reports healthy.
fn healthy_subset(servers: Vec<ServerInfo>) -> Vec<ServerInfo> {
    let healthy: Vec<ServerInfo> = servers
        .iter()
        .filter(|s| s.status == "healthy")
        .cloned()
        .collect();

    if healthy.is_empty() {
        warn!("no healthy servers reported, considering all candidates");
        servers
    } else {
        healthy
    }
}

/// Select the best server address from a candidate list.
async fn select_best(servers: Vec<ServerInfo>) -> Option<String> {
    let healthy = healthy_subset(servers);

    if healthy.len() == 1 {
        info!(server = %healthy[0].name, address = %healthy[0].address, "only one candidate");
        return Some(healthy[0].address.clone());
    }

    let probed: Vec<&ServerInfo> = healthy
        .iter()
        .filter(|s| {
            let overloaded = s.connections.utilization_percent > OVERLOAD_THRESHOLD;
            if overloaded {
                debug!(
                    server = %s.name,
                    utilization = s.connections.utilization_percent,
                    "skipping overloaded server"
                );
            }
            !overloaded
        })
        .collect();

    // Everything is overloaded: take the least loaded without probing.
    if probed.is_empty() {
        let least = healthy.iter().min_by(|a, b| {
            a.connections
                .utilization_percent
                .total_cmp(&b.connections.utilization_percent)
        })?;
        warn!(
            server = %least.name,
            utilization = least.connections.utilization_percent,
            "all servers overloaded, selecting least loaded"
        );
        return Some(least.address.clone());
    }

    // Probe latency to all remaining candidates concurrently, keeping
    // response order for the tie-break.
    let mut join_set = tokio::task::JoinSet::new();
    for (i, server) in probed.iter().enumerate() {
        let address = server.address.clone();
        join_set.spawn(async move { (i, probe_latency(&address).await) });
    }

    let mut latencies = vec![PROBE_FAILURE_MS; probed.len()];
    while let Some(result) = join_set.join_next().await {
        if let Ok((i, latency)) = result {
            latencies[i] = latency.as_millis() as u64;
        }
    }

    let inputs: Vec<(f64, u64)> = probed
        .iter()
        .zip(&latencies)
        .map(|(s, &lat)| (s.connections.utilization_percent, lat))
        .collect();

    let best = rank(&inputs)?;
    info!(
        server = %probed[best].name,
        address = %probed[best].address,
        utilization = probed[best].connections.utilization_percent,
        latency_ms = latencies[best],
        "selected exchange server"
    );
    Some(probed[best].address.clone())
}

/// Discover and select the best exchange endpoint.
///
/// Never fails: any error along the way returns `fallback`.
pub async fn select_endpoint(api_base: &str, fallback: &str) -> String {
    let servers = match discover_servers(api_base).await {
        Ok(servers) => servers,
        Err(e) => {
            warn!(error = %e, fallback = %fallback, "server discovery failed");
            return fallback.to_string();
        }
    };

    match select_best(servers).await {
        Some(address) => address,
        None => {
            warn!(fallback = %fallback, "server selection produced no candidate");
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, status: &str, utilization: f64) -> ServerInfo {
        ServerInfo {
            id: name.to_string(),
            name: name.to_string(),
            region: "us".into(),
            address: format!("{name}.example:8443"),
            status: status.to_string(),
            connections: ConnectionStats {
                current: 0,
                maximum: 100,
                available: 100,
                utilization_percent: utilization,
            },
        }
    }

    #[test]
    fn parses_api_response() {
        let body = r#"{
            "servers": [{
                "id": "srv-1",
                "name": "us-east",
                "region": "us",
                "address": "a.example:8443",
                "status": "healthy",
                "connections": {
                    "current": 10, "maximum": 100,
                    "available": 90, "utilization_percent": 10.0
                }
            }],
            "recommended": {"server_id": "srv-1", "reason": "load"}
        }"#;
        let parsed: ServerListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.servers.len(), 1);
        assert_eq!(parsed.servers[0].address, "a.example:8443");
        assert_eq!(parsed.servers[0].connections.utilization_percent, 10.0);
    }

    #[test]
    fn score_weights_load_over_latency() {
        // 50% load @ 100ms vs 10% load @ 900ms: the loaded server's RTT
        // advantage loses to the lighter server's load advantage.
        let loaded = score(50.0, 100);
        let light = score(10.0, 900);
        assert!(light > loaded);

        // But extreme latency (probe failure) overwhelms a modest load gap.
        let near = score(30.0, 50);
        let dead = score(10.0, PROBE_FAILURE_MS);
        assert!(dead > near);
    }

    #[test]
    fn rank_picks_minimum_score() {
        let candidates = vec![(80.0, 100), (10.0, 100), (50.0, 100)];
        assert_eq!(rank(&candidates), Some(1));
    }

    #[test]
    fn rank_breaks_ties_by_position() {
        let candidates = vec![(10.0, 100), (10.0, 100)];
        assert_eq!(rank(&candidates), Some(0));
        assert_eq!(rank(&[]), None);
    }

    #[test]
    fn healthy_filter_falls_back_to_all() {
        let servers = vec![server("a", "draining", 10.0), server("b", "down", 20.0)];
        let subset = healthy_subset(servers);
        assert_eq!(subset.len(), 2);

        let servers = vec![server("a", "healthy", 10.0), server("b", "down", 20.0)];
        let subset = healthy_subset(servers);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].name, "a");
    }

    #[tokio::test]
    async fn single_candidate_skips_probing() {
        let addr = select_best(vec![server("solo", "healthy", 95.0)]).await;
        assert_eq!(addr.as_deref(), Some("solo.example:8443"));
    }

    #[tokio::test]
    async fn all_overloaded_selects_least_loaded() {
        let addr = select_best(vec![
            server("a", "healthy", 99.0),
            server("b", "healthy", 92.0),
            server("c", "healthy", 97.0),
        ])
        .await;
        assert_eq!(addr.as_deref(), Some("b.example:8443"));
    }

    #[tokio::test]
    async fn discovery_failure_returns_fallback() {
        // Nothing listens on this port; the fetch errors inside its
        // deadline and the fallback address comes back.
        let addr = select_endpoint("http://127.0.0.1:9", "fallback.example:8443").await;
        assert_eq!(addr, "fallback.example:8443");
    }
}
