//! Liveness of the connected envoys.
//!
//! An envoy is online while its last heartbeat is at most two health check periods old.
//! Staleness is evaluated whenever the records are read. Records are never evicted: an envoy
//! that stopped sending heartbeats stays listed as offline.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::director::DirectorError;
use fedflow_core::{api::EnvoyInfo, EnvoyName};

/// What the director knows about one envoy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvoyRecord {
    pub is_online: bool,
    pub is_experiment_running: bool,
    pub last_updated: Instant,
    pub valid_duration: Duration,
}

impl EnvoyRecord {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_updated) <= self.valid_duration
    }
}

#[derive(Clone, Debug)]
pub struct EnvoyTracker {
    records: Arc<Mutex<HashMap<EnvoyName, EnvoyRecord>>>,
    health_check_period: Duration,
}

impl EnvoyTracker {
    pub fn new(health_check_period: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            health_check_period,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<EnvoyName, EnvoyRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn health_check_period(&self) -> Duration {
        self.health_check_period
    }

    fn valid_duration(&self) -> Duration {
        2 * self.health_check_period
    }

    /// Registers an envoy, replacing any previous record of the same name.
    pub fn acknowledge(&self, envoy: &EnvoyName) -> bool {
        let record = EnvoyRecord {
            is_online: true,
            is_experiment_running: false,
            last_updated: Instant::now(),
            valid_duration: self.valid_duration(),
        };
        if self.records().insert(envoy.clone(), record).is_some() {
            info!("envoy {} reconnected", envoy);
        } else {
            info!("envoy {} connected", envoy);
        }
        true
    }

    /// Records a heartbeat and returns the health check period.
    ///
    /// # Errors
    /// Fails with [`DirectorError::EnvoyNotFound`] if the envoy was never acknowledged.
    pub fn update_status(
        &self,
        envoy: &EnvoyName,
        is_experiment_running: bool,
    ) -> Result<Duration, DirectorError> {
        let valid_duration = self.valid_duration();
        let mut records = self.records();
        let record = records
            .get_mut(envoy)
            .ok_or_else(|| DirectorError::EnvoyNotFound(envoy.clone()))?;
        if !record.is_online {
            info!("envoy {} is back online", envoy);
        }
        record.is_online = true;
        record.is_experiment_running = is_experiment_running;
        record.last_updated = Instant::now();
        record.valid_duration = valid_duration;
        debug!(
            "heartbeat from envoy {} (experiment running: {})",
            envoy, is_experiment_running
        );
        Ok(self.health_check_period)
    }

    /// Snapshot of all envoys, sorted by name.
    pub fn envoys(&self) -> Vec<EnvoyInfo> {
        let now = Instant::now();
        let mut records = self.records();
        let mut envoys: Vec<EnvoyInfo> = records
            .iter_mut()
            .map(|(name, record)| {
                if record.is_online && !record.is_live(now) {
                    record.is_online = false;
                }
                EnvoyInfo {
                    envoy_name: name.clone(),
                    is_online: record.is_online,
                    is_experiment_running: record.is_experiment_running,
                    last_updated_secs: now.saturating_duration_since(record.last_updated).as_secs(),
                    valid_duration_secs: record.valid_duration.as_secs(),
                }
            })
            .collect();
        envoys.sort_by(|a, b| a.envoy_name.cmp(&b.envoy_name));
        envoys
    }

    /// Marks the envoys whose liveness window ran out as offline and returns them.
    pub fn expire_stale(&self) -> Vec<EnvoyName> {
        let now = Instant::now();
        let mut expired: Vec<EnvoyName> = self
            .records()
            .iter_mut()
            .filter(|(_, record)| record.is_online && !record.is_live(now))
            .map(|(name, record)| {
                record.is_online = false;
                name.clone()
            })
            .collect();
        expired.sort();
        for envoy in &expired {
            warn!("envoy {} missed its heartbeats and is now offline", envoy);
        }
        expired
    }
}
