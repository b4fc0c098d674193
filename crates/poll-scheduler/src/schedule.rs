use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use protocol::telemetry::QueryKind;
use types::{AddressBook, PollTarget};

/// Declared intervals above this are treated as bogus settings.
const MAX_PLAUSIBLE_INTERVAL_SECS: f64 = 86_400.0;

/// One entry of the poll rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryMessage {
    pub kind: QueryKind,
    /// Sent once to the subnet broadcast address instead of to each device.
    pub broadcast_only: bool,
}

impl QueryMessage {
    pub const fn each_device(kind: QueryKind) -> Self {
        Self {
            kind,
            broadcast_only: false,
        }
    }

    pub const fn broadcast(kind: QueryKind) -> Self {
        Self {
            kind,
            broadcast_only: true,
        }
    }
}

/// Status, battery, mode and meter queries, plus an identification broadcast
/// that keeps endpoint addresses fresh.
pub fn default_rotation() -> Vec<QueryMessage> {
    vec![
        QueryMessage::each_device(QueryKind::EsStatus),
        QueryMessage::each_device(QueryKind::BatStatus),
        QueryMessage::each_device(QueryKind::EsMode),
        QueryMessage::each_device(QueryKind::EmStatus),
        QueryMessage::broadcast(QueryKind::Device),
    ]
}

/// `max(floor, min(declared))`, or `max(floor, default)` when nothing plausible is declared.
pub fn effective_interval<'a>(
    targets: impl IntoIterator<Item = &'a PollTarget>,
    floor: Duration,
    default: Duration,
) -> Duration {
    let shortest = targets
        .into_iter()
        .filter_map(|target| target.interval_secs)
        .filter(|secs| secs.is_finite() && *secs > 0.0 && *secs <= MAX_PLAUSIBLE_INTERVAL_SECS)
        .reduce(f64::min);

    match shortest {
        Some(secs) => Duration::from_secs_f64(secs).max(floor),
        None => default.max(floor),
    }
}

/// What a single tick sends.
#[derive(Debug, Clone, PartialEq)]
pub struct TickPlan {
    pub message: QueryMessage,
    pub broadcast: bool,
    pub unicast: Vec<(String, SocketAddr)>,
    /// Devices skipped because no address is known yet.
    pub unaddressed: Vec<String>,
}

/// Tracked devices and the rotation cursor.
#[derive(Debug, Default)]
pub struct ScheduleState {
    targets: BTreeMap<String, PollTarget>,
    cursor: usize,
}

impl ScheduleState {
    /// Returns true when `target` is the first tracked device.
    pub fn insert(&mut self, target: PollTarget) -> bool {
        let first = self.targets.is_empty();
        self.targets.insert(target.device_id.clone(), target);
        first
    }

    pub fn remove(&mut self, device_id: &str) -> Option<PollTarget> {
        self.targets.remove(device_id)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn interval(&self, floor: Duration, default: Duration) -> Duration {
        effective_interval(self.targets.values(), floor, default)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Picks the next rotation entry and works out its recipients.
    pub fn plan_tick(
        &mut self,
        rotation: &[QueryMessage],
        addresses: &dyn AddressBook,
    ) -> Option<TickPlan> {
        if rotation.is_empty() || self.targets.is_empty() {
            return None;
        }
        let message = rotation[self.cursor % rotation.len()];
        self.cursor = (self.cursor + 1) % rotation.len();

        let mut plan = TickPlan {
            message,
            broadcast: message.broadcast_only,
            unicast: Vec::new(),
            unaddressed: Vec::new(),
        };
        if message.broadcast_only {
            return Some(plan);
        }

        for target in self.targets.values() {
            if target.broadcast {
                plan.broadcast = true;
                continue;
            }
            match addresses.address_of(&target.device_id) {
                Some(addr) => plan.unicast.push((target.device_id.clone(), addr)),
                None => plan.unaddressed.push(target.device_id.clone()),
            }
        }
        Some(plan)
    }
}
