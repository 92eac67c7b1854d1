use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Outcome of a TCP reachability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ProbeResult {
    Reachable { latency_ms: u64 },
    Refused(String),
    TimedOut,
}

impl ProbeResult {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeResult::Reachable { .. })
    }
}

// Try to open a TCP connection within `timeout`
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> ProbeResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => ProbeResult::Reachable {
            latency_ms: started.elapsed().as_millis() as u64,
        },
        Ok(Err(e)) => ProbeResult::Refused(e.to_string()),
        Err(_) => ProbeResult::TimedOut,
    }
}
