// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background health probing for registered modules.

use chrono::Utc;
use modscan_core::module::ModuleSpec;
use modscan_core::{ContainerState, ModuleDescriptor};
use modscan_queue::QueuePlane;
use std::collections::HashMap;
use std::time::Duration;

/// Number of consecutive failed probes before an external module flips to
/// unhealthy. A single blip does not take a module out of rotation.
pub const FAILURE_THRESHOLD: u32 = 2;

/// Per-module consecutive-failure counters, kept across probe ticks.
#[derive(Debug, Default)]
pub struct HealthTracker {
    consecutive_failures: HashMap<String, u32>,
}

impl HealthTracker {
    /// New tracker with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one probe and return the module's new health.
    ///
    /// A success immediately restores health; [`FAILURE_THRESHOLD`]
    /// consecutive failures are required to mark it down.
    pub fn record(&mut self, module_id: &str, probe_succeeded: bool) -> bool {
        if probe_succeeded {
            self.consecutive_failures.remove(module_id);
            return true;
        }
        let count = self.consecutive_failures.entry(module_id.to_string()).or_insert(0);
        *count += 1;
        *count < FAILURE_THRESHOLD
    }
}

/// Derive an internal module's health directly from its container state —
/// `running` is necessary but not sufficient; see [`probe_all`], which also
/// requires a successful queue-plane heartbeat round trip.
#[must_use]
pub fn internal_health(state: ContainerState) -> bool {
    matches!(state, ContainerState::Running)
}

/// Probe one external module's `healthcheck_url`, returning whether it
/// responded with a successful status within a short timeout.
pub async fn probe_external(client: &reqwest::Client, healthcheck_url: &str) -> bool {
    match client
        .get(healthcheck_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Write then immediately read back a heartbeat key for an internal module,
/// confirming the queue plane itself is reachable on top of `running`
/// container state (spec §4.4). Any failure on either leg counts as down.
pub async fn probe_internal_heartbeat(queue: &dyn QueuePlane, module_id: &str) -> bool {
    let now = Utc::now();
    if queue.write_heartbeat(module_id, now).await.is_err() {
        return false;
    }
    matches!(queue.read_heartbeat(module_id).await, Ok(Some(_)))
}

/// Run one probe pass over every descriptor, mutating `healthy` (and, for
/// externals, `last_seen_at`) in place.
pub async fn probe_all(
    client: &reqwest::Client,
    queue: &dyn QueuePlane,
    tracker: &mut HealthTracker,
    descriptors: &mut [ModuleDescriptor],
) {
    for descriptor in descriptors.iter_mut() {
        match &mut descriptor.spec {
            ModuleSpec::Internal(internal) => {
                let heartbeat_ok = probe_internal_heartbeat(queue, &descriptor.id).await;
                descriptor.healthy = internal_health(internal.container_state) && heartbeat_ok;
            }
            ModuleSpec::External(external) => {
                let ok = probe_external(client, &external.healthcheck_url).await;
                descriptor.healthy = tracker.record(&descriptor.id, ok);
                if ok {
                    external.last_seen_at = Some(Utc::now());
                }
            }
        }
    }
}
