//! Migration evaluation: does a server trigger justify moving cloudlets?
//!
//! - Replacement triggers carry their new cloudlet and are approved when it
//!   differs from the current one
//! - `LatencyProcessed` above the threshold starts a performance resolution
//!   and a fresh latency test of the candidate; the candidate must beat the
//!   current average by more than the switch margin
//!
//! Performance resolutions are expensive, so at most one runs at a time.
//! A trigger arriving while one is in flight is dropped, not queued.

use crate::channel::ServerTrigger;
use crate::config::EdgeEventsConfig;
use crate::error::{EdgeEventsFailure, FailureReason, FindCloudletFailure};
use crate::models::{CloudletDescriptor, LatencyStats};
use crate::probe::LatencyTester;
use crate::registry::SessionRegistry;
use crate::resolver::CloudletResolver;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Source of performance-mode candidates
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn performance_candidate(&self) -> Result<CloudletDescriptor, FindCloudletFailure>;
}

#[async_trait]
impl CandidateSource for CloudletResolver {
    async fn performance_candidate(&self) -> Result<CloudletDescriptor, FindCloudletFailure> {
        self.find_performance_candidate().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionReason {
    NewCloudletAvailable,
    LatencyImproved { current_ms: f64, candidate_ms: f64 },
    CurrentCloudletIsBest,
    NoReplacementCloudlet,
    LatencyBelowThreshold { avg_ms: f64, threshold_ms: f64 },
    TriggerDisabled,
    EvaluationInFlight,
    NotAMigrationSignal,
    ServerError(String),
    ResolutionFailed(String),
    LatencyTestFailed(String),
}

impl DecisionReason {
    /// What the host's failure callback hears about a rejection, if anything.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            DecisionReason::CurrentCloudletIsBest => Some(FailureReason::CurrentCloudletIsBest),
            DecisionReason::NoReplacementCloudlet => Some(FailureReason::NoReplacementCloudlet),
            DecisionReason::ServerError(_) => Some(FailureReason::ServerError),
            DecisionReason::ResolutionFailed(_) => Some(FailureReason::FindCloudletFailed),
            DecisionReason::LatencyTestFailed(_) => Some(FailureReason::LatencyTestFailed),
            _ => None,
        }
    }

    /// Rejections that discard a real migration signal. The host hears
    /// nothing about these, so they are logged as warnings.
    pub fn discards_signal(&self) -> bool {
        matches!(self, DecisionReason::EvaluationInFlight)
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::NewCloudletAvailable => f.write_str("server supplied a new cloudlet"),
            DecisionReason::LatencyImproved { current_ms, candidate_ms } => {
                write!(f, "candidate {candidate_ms:.2}ms beats current {current_ms:.2}ms")
            }
            DecisionReason::CurrentCloudletIsBest => f.write_str("current cloudlet is best"),
            DecisionReason::NoReplacementCloudlet => f.write_str("trigger fired without replacement"),
            DecisionReason::LatencyBelowThreshold { avg_ms, threshold_ms } => {
                write!(f, "latency {avg_ms:.2}ms within threshold {threshold_ms:.2}ms")
            }
            DecisionReason::TriggerDisabled => f.write_str("trigger not enabled"),
            DecisionReason::EvaluationInFlight => f.write_str("performance evaluation already in flight"),
            DecisionReason::NotAMigrationSignal => f.write_str("not a migration signal"),
            DecisionReason::ServerError(msg) => write!(f, "server error: {msg}"),
            DecisionReason::ResolutionFailed(msg) => write!(f, "performance resolution failed: {msg}"),
            DecisionReason::LatencyTestFailed(msg) => write!(f, "candidate latency test failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationDecision {
    pub approved: bool,
    pub reason: DecisionReason,
    pub candidate: Option<CloudletDescriptor>,
    pub trigger: ServerTrigger,
}

impl MigrationDecision {
    fn approve(trigger: ServerTrigger, candidate: CloudletDescriptor, reason: DecisionReason) -> Self {
        Self { approved: true, reason, candidate: Some(candidate), trigger }
    }

    fn reject(trigger: ServerTrigger, reason: DecisionReason) -> Self {
        Self { approved: false, reason, candidate: None, trigger }
    }

    /// Failure notification for a rejected decision, if it is reportable.
    pub fn failure(&self) -> Option<EdgeEventsFailure> {
        if self.approved {
            return None;
        }
        self.reason
            .failure_reason()
            .map(|reason| EdgeEventsFailure::new(reason, format!("{}: {}", self.trigger.name(), self.reason)))
    }
}

/// `candidate` must beat `current` by more than `margin` (a fraction).
pub fn should_migrate(current_ms: f64, candidate_ms: f64, margin: f64) -> bool {
    candidate_ms < current_ms - current_ms * margin
}

struct SlotGuard(Arc<AtomicBool>);

impl SlotGuard {
    fn try_acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard(slot.clone()))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct MigrationEvaluator {
    config: Arc<EdgeEventsConfig>,
    registry: SessionRegistry,
    candidates: Arc<dyn CandidateSource>,
    tester: LatencyTester,
    performance_slot: Arc<AtomicBool>,
}

impl MigrationEvaluator {
    pub fn new(
        config: Arc<EdgeEventsConfig>,
        registry: SessionRegistry,
        candidates: Arc<dyn CandidateSource>,
        tester: LatencyTester,
    ) -> Self {
        Self { config, registry, candidates, tester, performance_slot: Arc::new(AtomicBool::new(false)) }
    }

    pub fn performance_in_flight(&self) -> bool {
        self.performance_slot.load(Ordering::Acquire)
    }

    pub async fn evaluate(&self, trigger: ServerTrigger) -> MigrationDecision {
        let decision = self.decide(trigger).await;
        if decision.approved {
            info!("{} approved: {}", decision.trigger.name(), decision.reason);
        } else {
            debug!("{} rejected: {}", decision.trigger.name(), decision.reason);
        }
        decision
    }

    async fn decide(&self, trigger: ServerTrigger) -> MigrationDecision {
        match &trigger {
            ServerTrigger::InitConnection | ServerTrigger::LatencyRequest => {
                return MigrationDecision::reject(trigger, DecisionReason::NotAMigrationSignal)
            }
            ServerTrigger::Error(msg) => {
                let reason = DecisionReason::ServerError(msg.clone());
                return MigrationDecision::reject(trigger, reason);
            }
            _ => {}
        }

        if let Some(kind) = trigger.find_cloudlet_trigger() {
            if !self.config.trigger_enabled(kind) {
                return MigrationDecision::reject(trigger, DecisionReason::TriggerDisabled);
            }
        }

        if let ServerTrigger::LatencyProcessed(stats) = &trigger {
            let stats = stats.clone();
            return self.decide_on_latency(trigger, stats).await;
        }

        let Some(candidate) = trigger.new_cloudlet().cloned() else {
            return MigrationDecision::reject(trigger, DecisionReason::NoReplacementCloudlet);
        };
        if self.is_current(&candidate) {
            return MigrationDecision::reject(trigger, DecisionReason::CurrentCloudletIsBest);
        }
        MigrationDecision::approve(trigger, candidate, DecisionReason::NewCloudletAvailable)
    }

    async fn decide_on_latency(&self, trigger: ServerTrigger, stats: LatencyStats) -> MigrationDecision {
        let threshold_ms = self.config.latency_threshold_ms;
        if stats.avg <= threshold_ms {
            let reason = DecisionReason::LatencyBelowThreshold { avg_ms: stats.avg, threshold_ms };
            return MigrationDecision::reject(trigger, reason);
        }

        let Some(_slot) = SlotGuard::try_acquire(&self.performance_slot) else {
            return MigrationDecision::reject(trigger, DecisionReason::EvaluationInFlight);
        };

        let candidate = match self.candidates.performance_candidate().await {
            Ok(candidate) => candidate,
            Err(e) => return MigrationDecision::reject(trigger, DecisionReason::ResolutionFailed(e.to_string())),
        };
        if self.is_current(&candidate) {
            return MigrationDecision::reject(trigger, DecisionReason::CurrentCloudletIsBest);
        }

        let samples = match self.tester.measure_cloudlet(&candidate, self.config.latency_test_port).await {
            Ok(samples) => samples,
            Err(e) => return MigrationDecision::reject(trigger, DecisionReason::LatencyTestFailed(e.to_string())),
        };
        let Some(candidate_stats) = LatencyStats::from_samples(&samples) else {
            return MigrationDecision::reject(trigger, DecisionReason::LatencyTestFailed("no samples".into()));
        };

        debug!(
            "candidate {} avg {:.2}ms vs current {:.2}ms (margin {})",
            candidate.fqdn, candidate_stats.avg, stats.avg, self.config.performance_switch_margin
        );
        if should_migrate(stats.avg, candidate_stats.avg, self.config.performance_switch_margin) {
            let reason = DecisionReason::LatencyImproved { current_ms: stats.avg, candidate_ms: candidate_stats.avg };
            MigrationDecision::approve(trigger, candidate, reason)
        } else {
            MigrationDecision::reject(trigger, DecisionReason::CurrentCloudletIsBest)
        }
    }

    fn is_current(&self, candidate: &CloudletDescriptor) -> bool {
        self.registry.current_cloudlet().is_some_and(|current| current.same_endpoint(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FindCloudletEventTrigger;
    use crate::error::ProbeError;
    use crate::models::{AppPort, Location};
    use crate::probe::TransportProbe;
    use chrono::Utc;
    use tokio::sync::Notify;

    struct FixedCandidate {
        fqdn: &'static str,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl CandidateSource for FixedCandidate {
        async fn performance_candidate(&self) -> Result<CloudletDescriptor, FindCloudletFailure> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(cloudlet(self.fqdn))
        }
    }

    struct FixedLatency(f64);

    #[async_trait]
    impl TransportProbe for FixedLatency {
        async fn connect_test(&self, _host: &str, _port: u16) -> Result<f64, ProbeError> {
            Ok(self.0)
        }

        async fn ping_test(&self, _host: &str) -> Result<f64, ProbeError> {
            Ok(self.0)
        }
    }

    fn cloudlet(fqdn: &str) -> CloudletDescriptor {
        CloudletDescriptor::new(fqdn, vec![AppPort::tcp(8008)], Location::new(37.33, -121.88))
    }

    fn stats(avg: f64) -> LatencyStats {
        LatencyStats { avg, min: avg, max: avg, std_dev: 0.0, variance: 0.0, num_samples: 5, timestamp: Utc::now() }
    }

    fn evaluator(candidate_ms: f64, source: FixedCandidate, config: EdgeEventsConfig) -> MigrationEvaluator {
        let registry = SessionRegistry::new();
        registry.record_cloudlet(cloudlet("edge1.example.net"));
        MigrationEvaluator::new(
            Arc::new(config),
            registry,
            Arc::new(source),
            LatencyTester::new(Arc::new(FixedLatency(candidate_ms)), 3),
        )
    }

    fn margin_config() -> EdgeEventsConfig {
        EdgeEventsConfig { latency_threshold_ms: 50.0, performance_switch_margin: 0.10, ..Default::default() }
    }

    #[test]
    fn test_margin_is_strict() {
        assert!(should_migrate(100.0, 85.0, 0.10));
        assert!(!should_migrate(100.0, 90.0, 0.10));
        assert!(!should_migrate(100.0, 92.0, 0.10));
        assert!(!should_migrate(100.0, 100.0, 0.0));
    }

    #[tokio::test]
    async fn test_latency_improvement_approved() {
        let evaluator = evaluator(85.0, FixedCandidate { fqdn: "edge2.example.net", gate: None }, margin_config());
        let decision = evaluator.evaluate(ServerTrigger::LatencyProcessed(stats(100.0))).await;
        assert!(decision.approved);
        assert_eq!(decision.candidate.unwrap().fqdn, "edge2.example.net");
        assert_eq!(decision.reason, DecisionReason::LatencyImproved { current_ms: 100.0, candidate_ms: 85.0 });
    }

    #[tokio::test]
    async fn test_within_margin_rejected() {
        let evaluator = evaluator(92.0, FixedCandidate { fqdn: "edge2.example.net", gate: None }, margin_config());
        let decision = evaluator.evaluate(ServerTrigger::LatencyProcessed(stats(100.0))).await;
        assert!(!decision.approved);
        assert_eq!(decision.reason, DecisionReason::CurrentCloudletIsBest);
        let failure = decision.failure().unwrap();
        assert_eq!(failure.reason, FailureReason::CurrentCloudletIsBest);
        assert!(!failure.reason.is_hard_failure());
    }

    #[tokio::test]
    async fn test_below_threshold_not_reported() {
        let evaluator = evaluator(10.0, FixedCandidate { fqdn: "edge2.example.net", gate: None }, margin_config());
        let decision = evaluator.evaluate(ServerTrigger::LatencyProcessed(stats(40.0))).await;
        assert_eq!(decision.reason, DecisionReason::LatencyBelowThreshold { avg_ms: 40.0, threshold_ms: 50.0 });
        assert!(decision.failure().is_none());
    }

    #[tokio::test]
    async fn test_single_performance_slot() {
        let gate = Arc::new(Notify::new());
        let evaluator = evaluator(
            20.0,
            FixedCandidate { fqdn: "edge2.example.net", gate: Some(gate.clone()) },
            margin_config(),
        );

        let first = tokio::spawn({
            let evaluator = evaluator.clone();
            async move { evaluator.evaluate(ServerTrigger::LatencyProcessed(stats(100.0))).await }
        });
        while !evaluator.performance_in_flight() {
            tokio::task::yield_now().await;
        }

        let second = evaluator.evaluate(ServerTrigger::LatencyProcessed(stats(120.0))).await;
        assert_eq!(second.reason, DecisionReason::EvaluationInFlight);
        assert!(second.failure().is_none());
        assert!(second.reason.discards_signal());
        assert!(!DecisionReason::NotAMigrationSignal.discards_signal());

        gate.notify_one();
        assert!(first.await.unwrap().approved);
        assert!(!evaluator.performance_in_flight());
    }

    #[tokio::test]
    async fn test_replacement_triggers() {
        let mut config = EdgeEventsConfig::default();
        config.new_find_cloudlet_triggers = vec![FindCloudletEventTrigger::AppInstHealthChanged];
        let evaluator = evaluator(10.0, FixedCandidate { fqdn: "unused", gate: None }, config);

        let moved = ServerTrigger::HealthChanged {
            status: "HEALTH_CHECK_FAIL_SERVER_FAIL".into(),
            new_cloudlet: Some(cloudlet("edge2.example.net")),
        };
        assert_eq!(evaluator.evaluate(moved).await.reason, DecisionReason::NewCloudletAvailable);

        let same = ServerTrigger::HealthChanged { status: "OK".into(), new_cloudlet: Some(cloudlet("EDGE1.example.net")) };
        assert_eq!(evaluator.evaluate(same).await.reason, DecisionReason::CurrentCloudletIsBest);

        let none = ServerTrigger::HealthChanged { status: "OK".into(), new_cloudlet: None };
        let decision = evaluator.evaluate(none).await;
        assert_eq!(decision.failure().unwrap().reason, FailureReason::NoReplacementCloudlet);

        let disabled = ServerTrigger::CloudletUpdate(Some(cloudlet("edge3.example.net")));
        assert_eq!(evaluator.evaluate(disabled).await.reason, DecisionReason::TriggerDisabled);

        assert_eq!(
            evaluator.evaluate(ServerTrigger::LatencyRequest).await.reason,
            DecisionReason::NotAMigrationSignal
        );
        let error = evaluator.evaluate(ServerTrigger::Error("boom".into())).await;
        assert_eq!(error.failure().unwrap().reason, FailureReason::ServerError);
    }
}
