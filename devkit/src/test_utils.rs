/*!
Test harness for EdgeLink sessions

Wires the SDK to in-memory fakes:
- `MockDirectory` for Register/FindCloudlet/GetAppInstList
- `MockEventTransport` for the edge-events stream
- `MockProbe`, `FixedLocation`, `MockDeviceInfo` for device collaborators
- `RecordingHost` for the host callbacks
*/

use crate::device_stub::{FixedLocation, MockDeviceInfo, MockProbe};
use crate::dme_stub::MockDirectory;
use crate::mqtt_stub::MockEventTransport;
use anyhow::Result;
use edgelink_sdk::channel::wire::{ClientEdgeEvent, ClientEventType, ServerEdgeEvent};
use edgelink_sdk::config::{DirectoryConfig, EdgeEventsConfig, EventsConfig};
use edgelink_sdk::coordinator::{ConnectionUpgrade, HostCallbacks};
use edgelink_sdk::error::EdgeEventsFailure;
use edgelink_sdk::models::{ClientIdentity, FindCloudletMode};
use edgelink_sdk::probe::LatencyTester;
use edgelink_sdk::registry::SessionRegistry;
use edgelink_sdk::{CloudletResolver, EdgeEventsManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Host side of the callbacks, recording every notification
#[derive(Clone, Default)]
pub struct RecordingHost {
    upgrades: Arc<Mutex<Vec<ConnectionUpgrade>>>,
    failures: Arc<Mutex<Vec<EdgeEventsFailure>>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> HostCallbacks {
        let (upgrades, failures) = (self.upgrades.clone(), self.failures.clone());
        HostCallbacks::new()
            .on_connection_upgrade(move |upgrade| upgrades.lock().push(upgrade))
            .on_connection_failure(move |failure| failures.lock().push(failure))
    }

    pub fn upgrades(&self) -> Vec<ConnectionUpgrade> {
        self.upgrades.lock().clone()
    }

    pub fn failures(&self) -> Vec<EdgeEventsFailure> {
        self.failures.lock().clone()
    }
}

#[derive(Debug)]
struct Expectation {
    kind: ClientEventType,
    expected_count: usize,
}

/// Complete fake environment for one SDK session
pub struct TestHarness {
    pub directory: Arc<MockDirectory>,
    pub transport: MockEventTransport,
    pub probe: Arc<MockProbe>,
    pub location: Arc<FixedLocation>,
    pub device: Arc<MockDeviceInfo>,
    pub host: RecordingHost,
    pub config: EdgeEventsConfig,
    pub directory_config: DirectoryConfig,
    expectations: Vec<Expectation>,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        Self {
            directory: Arc::new(MockDirectory::new()),
            transport: MockEventTransport::new(),
            probe: Arc::new(MockProbe::new(40.0)),
            location: Arc::new(FixedLocation::new(37.33, -121.88)),
            device: Arc::new(MockDeviceInfo::wifi()),
            host: RecordingHost::new(),
            config: EdgeEventsConfig::default(),
            directory_config: DirectoryConfig::default(),
            expectations: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EdgeEventsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_device(mut self, device: MockDeviceInfo) -> Self {
        self.device = Arc::new(device);
        self
    }

    pub fn resolver(&self) -> CloudletResolver {
        CloudletResolver::new(
            self.directory.clone(),
            self.directory_config.clone(),
            SessionRegistry::new(),
            self.location.clone(),
            self.device.clone(),
            LatencyTester::new(self.probe.clone(), self.config.samples_per_test),
        )
        .with_default_location(self.config.default_location.clone())
        .with_latency_test_port(self.config.latency_test_port)
    }

    pub fn manager(&self) -> EdgeEventsManager {
        EdgeEventsManager::new(
            self.config.clone(),
            EventsConfig::default(),
            Arc::new(self.resolver()),
            Arc::new(self.transport.clone()),
            self.location.clone(),
            self.device.clone(),
        )
    }

    /// Manager whose session is registered and has a current cloudlet.
    pub async fn registered_manager(&self) -> Result<EdgeEventsManager> {
        let manager = self.manager();
        manager
            .resolver()
            .register_and_find_cloudlet(ClientIdentity::new("Acme", "Game", "1.0"), None, None, FindCloudletMode::Proximity)
            .await?;
        Ok(manager)
    }

    /// Registered manager with edge events running.
    pub async fn started_manager(&self) -> Result<EdgeEventsManager> {
        let manager = self.registered_manager().await?;
        manager.start(self.host.callbacks()).await?;
        log::info!("🚀 Edge events session started");
        Ok(manager)
    }

    /// Push a server frame into the session.
    pub async fn send_event(&self, event: ServerEdgeEvent) -> Result<()> {
        self.transport.simulate_incoming(&event).await
    }

    /// Wait until at least `count` frames of `kind` were published.
    pub async fn wait_for_events(&self, kind: ClientEventType, count: usize, timeout_ms: u64) -> Result<Vec<ClientEdgeEvent>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let events = self.transport.events_of(kind);
            if events.len() >= count {
                return Ok(events);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timeout waiting for {} {:?} frames, got {}", count, kind, events.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_upgrade(&self, timeout_ms: u64) -> Result<ConnectionUpgrade> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if let Some(upgrade) = self.host.upgrades().pop() {
                log::info!("✅ Upgrade to {}", upgrade.cloudlet.fqdn);
                return Ok(upgrade);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("timeout waiting for connection upgrade")
    }

    pub async fn wait_for_failure(&self, timeout_ms: u64) -> Result<EdgeEventsFailure> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if let Some(failure) = self.host.failures().pop() {
                return Ok(failure);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("timeout waiting for connection failure")
    }

    /// Let spawned tasks drain without advancing much time.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Expect exactly `count` frames of `kind` once `verify_expectations` runs.
    pub fn expect_messages(&mut self, kind: ClientEventType, count: usize) -> &mut Self {
        self.expectations.push(Expectation { kind, expected_count: count });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual = self.transport.count(expectation.kind);
            if actual != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for {:?}: expected {} frames, got {}",
                    expectation.kind,
                    expectation.expected_count,
                    actual
                );
            }
            log::info!("✅ {:?}: {} frames as expected", expectation.kind, actual);
        }
        Ok(())
    }

    pub fn current_fqdn(manager: &EdgeEventsManager) -> Option<String> {
        manager.current_cloudlet().map(|c| c.fqdn.clone())
    }

    pub fn get_stats(&self) -> TestStats {
        let mut frame_counts = HashMap::new();
        for event in self.transport.published_events() {
            *frame_counts.entry(event.event_type).or_insert(0) += 1;
        }
        TestStats {
            total_frames: self.transport.get_published_messages().len(),
            frame_counts,
            connects: self.transport.connect_count(),
            upgrades: self.host.upgrades().len(),
            failures: self.host.failures().len(),
        }
    }

    pub fn reset(&mut self) {
        self.transport.clear();
        self.expectations.clear();
        log::info!("🧹 Test harness reset");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_frames: usize,
    pub frame_counts: HashMap<ClientEventType, usize>,
    pub connects: usize,
    pub upgrades: usize,
    pub failures: usize,
}

impl TestStats {
    pub fn print(&self) {
        println!("📊 Test Statistics:");
        println!("  Total frames: {}", self.total_frames);
        for (kind, count) in &self.frame_counts {
            println!("    {:?}: {}", kind, count);
        }
        println!("  Connects: {}, upgrades: {}, failures: {}", self.connects, self.upgrades, self.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_basic_session() {
        let mut harness = TestHarness::new();
        let manager = harness.started_manager().await.unwrap();
        harness.settle().await;

        harness.expect_messages(ClientEventType::InitConnection, 1);
        harness.verify_expectations().unwrap();
        assert_eq!(TestHarness::current_fqdn(&manager).as_deref(), Some("edge1.example.net"));

        manager.stop().await;
        harness.expect_messages(ClientEventType::TerminateConnection, 1);
        harness.verify_expectations().unwrap();

        let stats = harness.get_stats();
        assert_eq!(stats.connects, 1);
        stats.print();
    }
}
