//! Latency probing: TCP connect tests and ICMP ping tests
//!
//! `NetProbe` is the default `TransportProbe`; `LatencyTester` turns single
//! probes into sample sets against a cloudlet, preferring a TCP connect test
//! and falling back to ping when the cloudlet exposes no TCP port.

use crate::error::ProbeError;
use crate::models::{CloudletDescriptor, LProto, LatencySample};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Single round-trip measurement against a host
#[async_trait]
pub trait TransportProbe: Send + Sync {
    /// TCP connect round trip in milliseconds.
    async fn connect_test(&self, host: &str, port: u16) -> Result<f64, ProbeError>;

    /// ICMP echo round trip in milliseconds.
    async fn ping_test(&self, host: &str) -> Result<f64, ProbeError>;
}

/// Probe using real sockets and the system `ping` binary
#[derive(Debug, Clone)]
pub struct NetProbe {
    timeout: Duration,
}

impl NetProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn ping_command(&self, host: &str) -> AsyncCommand {
        let mut cmd = AsyncCommand::new("ping");
        if cfg!(target_os = "windows") {
            cmd.args(["-n", "1", "-w", &self.timeout.as_millis().to_string(), host]);
        } else if cfg!(target_os = "macos") {
            cmd.args(["-c", "1", "-t", &self.timeout.as_secs().max(1).to_string(), host]);
        } else {
            cmd.args(["-c", "1", "-W", &self.timeout.as_secs().max(1).to_string(), host]);
        }
        cmd
    }
}

impl Default for NetProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl TransportProbe for NetProbe {
    async fn connect_test(&self, host: &str, port: u16) -> Result<f64, ProbeError> {
        let target = format!("{host}:{port}");
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => {
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                debug!("connect test {} took {:.2}ms", target, elapsed);
                Ok(elapsed)
            }
            Ok(Err(e)) => Err(ProbeError::Io(format!("{target}: {e}"))),
            Err(_) => Err(ProbeError::Timeout(target)),
        }
    }

    async fn ping_test(&self, host: &str) -> Result<f64, ProbeError> {
        let output = tokio::time::timeout(self.timeout + Duration::from_secs(1), self.ping_command(host).output())
            .await
            .map_err(|_| ProbeError::Timeout(host.to_string()))?
            .map_err(|e| ProbeError::Io(format!("ping {host}: {e}")))?;

        if !output.status.success() {
            return Err(ProbeError::Io(format!("ping {host} exited with {}", output.status)));
        }
        parse_ping_time(&String::from_utf8_lossy(&output.stdout)).ok_or(ProbeError::Unparseable)
    }
}

/// Extract the round trip from `ping` output (`time=12.3 ms`, `time<1ms`).
pub fn parse_ping_time(output: &str) -> Option<f64> {
    let idx = output.find("time=").map(|i| i + 5).or_else(|| output.find("time<").map(|i| i + 5))?;
    let value: String = output[idx..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    value.parse().ok()
}

/// Runs sample sets of probes against cloudlets
#[derive(Clone)]
pub struct LatencyTester {
    probe: Arc<dyn TransportProbe>,
    samples_per_test: u32,
}

/// Which test a sample set came from
#[derive(Debug, Clone, PartialEq)]
pub enum TestTarget {
    Connect { host: String, port: u16 },
    Ping { host: String },
}

impl LatencyTester {
    pub fn new(probe: Arc<dyn TransportProbe>, samples_per_test: u32) -> Self {
        Self { probe, samples_per_test: samples_per_test.max(1) }
    }

    pub fn probe(&self) -> &Arc<dyn TransportProbe> {
        &self.probe
    }

    /// Pick the test for a cloudlet: connect on `preferred_port` (or the
    /// first TCP port when 0), ping otherwise.
    pub fn target_for(cloudlet: &CloudletDescriptor, preferred_port: u16) -> Result<TestTarget, ProbeError> {
        let tcp_port = if preferred_port != 0 {
            cloudlet.find_port(preferred_port).filter(|p| p.proto == LProto::Tcp).map(|p| (p, preferred_port))
        } else {
            cloudlet.first_port(LProto::Tcp).map(|p| (p, p.public_port))
        };

        match tcp_port {
            Some((port, number)) => Ok(TestTarget::Connect { host: cloudlet.host_for(port), port: number }),
            None if !cloudlet.fqdn.is_empty() => Ok(TestTarget::Ping { host: cloudlet.fqdn.clone() }),
            None => Err(ProbeError::NoTestPort),
        }
    }

    pub async fn connect_samples(&self, host: &str, port: u16) -> Result<Vec<LatencySample>, ProbeError> {
        let mut samples = Vec::with_capacity(self.samples_per_test as usize);
        let mut last_error = None;
        for _ in 0..self.samples_per_test {
            match self.probe.connect_test(host, port).await {
                Ok(value) => samples.push(LatencySample { value, timestamp: Utc::now() }),
                Err(e) => last_error = Some(e),
            }
        }
        finish(samples, last_error)
    }

    pub async fn ping_samples(&self, host: &str) -> Result<Vec<LatencySample>, ProbeError> {
        let mut samples = Vec::with_capacity(self.samples_per_test as usize);
        let mut last_error = None;
        for _ in 0..self.samples_per_test {
            match self.probe.ping_test(host).await {
                Ok(value) => samples.push(LatencySample { value, timestamp: Utc::now() }),
                Err(e) => last_error = Some(e),
            }
        }
        finish(samples, last_error)
    }

    pub async fn measure(&self, target: &TestTarget) -> Result<Vec<LatencySample>, ProbeError> {
        match target {
            TestTarget::Connect { host, port } => self.connect_samples(host, *port).await,
            TestTarget::Ping { host } => self.ping_samples(host).await,
        }
    }

    /// Sample set for a cloudlet, picking the test with `target_for`.
    pub async fn measure_cloudlet(
        &self,
        cloudlet: &CloudletDescriptor,
        preferred_port: u16,
    ) -> Result<Vec<LatencySample>, ProbeError> {
        let target = Self::target_for(cloudlet, preferred_port)?;
        self.measure(&target).await
    }
}

// Partial sample sets are kept; only a fully failed set is an error.
fn finish(samples: Vec<LatencySample>, last_error: Option<ProbeError>) -> Result<Vec<LatencySample>, ProbeError> {
    if samples.is_empty() {
        Err(last_error.unwrap_or(ProbeError::NoTestPort))
    } else {
        Ok(samples)
    }
}
