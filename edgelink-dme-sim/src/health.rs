use crate::directory::Directory;
use crate::state::Shared;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, Serialize, Deserialize)]
pub struct SimHealth {
    pub started_at: String,
    pub uptime_seconds: u64,
    pub sessions: u32,
    pub edge_sessions: u32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    started_at: OffsetDateTime,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_at: OffsetDateTime::now_utc(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: crate::state::new_state("connecting".to_string()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, directory: &Shared<Directory>) -> SimHealth {
        let (sessions, edge_sessions) = {
            let dir = directory.lock();
            (dir.session_count() as u32, dir.edge_session_count() as u32)
        };
        SimHealth {
            started_at: self.started_at.format(&Rfc3339).unwrap_or_default(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            sessions,
            edge_sessions,
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::state::new_state;

    #[test]
    fn test_health_counts_and_status() {
        let tracker = HealthTracker::new();
        let directory = new_state(Directory::new(SimConfig::default()));

        let health = tracker.get_health(&directory);
        assert_eq!(health.mqtt_status, "connecting");
        assert_eq!(health.sessions, 0);
        assert!(OffsetDateTime::parse(&health.started_at, &Rfc3339).is_ok());

        tracker.increment_reconnects();
        assert_eq!(tracker.get_health(&directory).mqtt_reconnects, 1);
        assert_eq!(tracker.get_health(&directory).mqtt_status, "reconnecting");
        tracker.mark_mqtt_connected();
        assert_eq!(tracker.get_health(&directory).mqtt_status, "connected");
    }
}
