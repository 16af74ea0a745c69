//! Notifier bus (component F): location-scoped publish/subscribe of change
//! events, resolved to drop-on-full backpressure (§4.6, §9).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::registry::{HypervisorRecord, ProbeStatus};
use crate::topology::location_ancestors;

#[derive(Debug, Clone)]
pub enum Update {
    Snapshot(LocationSnapshot),
    VmAdded { hostname: String, ip: Ipv4Addr },
    VmChanged { hostname: String, ip: Ipv4Addr },
    VmDeleted { hostname: String, ip: Ipv4Addr },
    HypervisorStatusChanged { hostname: String, status: ProbeStatus },
    MachineTagsChanged { hostname: String, tags: BTreeMap<String, String> },
    HypervisorRemoved { hostname: String },
    TopologyChanged,
}

#[derive(Debug, Clone, Default)]
pub struct LocationSnapshot {
    pub hypervisors: Vec<HypervisorSummary>,
}

#[derive(Debug, Clone)]
pub struct HypervisorSummary {
    pub hostname: String,
    pub status: ProbeStatus,
    pub vm_ips: Vec<Ipv4Addr>,
}

impl HypervisorSummary {
    pub fn from_record(record: &HypervisorRecord) -> Self {
        let mut vm_ips: Vec<Ipv4Addr> = record.vms.keys().copied().collect();
        vm_ips.sort();
        HypervisorSummary {
            hostname: record.hostname.clone(),
            status: record.probe_status,
            vm_ips,
        }
    }
}

/// A single subscription: the owning location path (for the reverse index
/// used by `close_update_channel`), its sender, and a drop counter shared
/// with the receiver handle so callers can detect backpressure.
pub struct Subscriber {
    pub location: String,
    pub sender: mpsc::Sender<Update>,
    pub dropped: Arc<AtomicU64>,
}

/// Handed back to the caller of `make_update_channel`.
pub struct UpdateReceiver {
    pub id: u64,
    pub receiver: mpsc::Receiver<Update>,
    pub dropped: Arc<AtomicU64>,
}

/// Deliver `update` to every subscriber whose watched location is `location`
/// or an ancestor of it (slash-boundary prefix match, computed here by
/// walking ancestors rather than at subscribe time).
pub fn publish(
    locations: &std::collections::HashMap<String, Vec<u64>>,
    subscribers: &std::collections::HashMap<u64, Subscriber>,
    location: &str,
    update: Update,
) {
    let mut paths = location_ancestors(location);
    paths.insert(0, location.to_string());

    for path in paths {
        let Some(ids) = locations.get(&path) else {
            continue;
        };
        for id in ids {
            let Some(sub) = subscribers.get(id) else {
                continue;
            };
            match sub.sender.try_send(update.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        location = %path,
                        subscriber = id,
                        "notifier channel full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Register a new subscriber for `location` and send it an opening snapshot
/// so it observes consistent initial state before any delta.
pub fn subscribe(
    locations: &mut std::collections::HashMap<String, Vec<u64>>,
    subscribers: &mut std::collections::HashMap<u64, Subscriber>,
    id: u64,
    location: String,
    buffer_depth: usize,
    snapshot: LocationSnapshot,
) -> UpdateReceiver {
    let (tx, rx) = mpsc::channel(buffer_depth.max(1));
    let dropped = Arc::new(AtomicU64::new(0));

    // The opening snapshot is sent before the subscriber is registered for
    // live deltas, so it can never race with a concurrent publish.
    let _ = tx.try_send(Update::Snapshot(snapshot));

    locations.entry(location.clone()).or_default().push(id);
    subscribers.insert(
        id,
        Subscriber {
            location,
            sender: tx,
            dropped: dropped.clone(),
        },
    );

    UpdateReceiver { id, receiver: rx, dropped }
}

/// Idempotent: removing an id that isn't present is a no-op.
pub fn unsubscribe(
    locations: &mut std::collections::HashMap<String, Vec<u64>>,
    subscribers: &mut std::collections::HashMap<u64, Subscriber>,
    id: u64,
) {
    if let Some(sub) = subscribers.remove(&id) {
        if let Some(ids) = locations.get_mut(&sub.location) {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                locations.remove(&sub.location);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn subscriber_to_ancestor_receives_descendant_events() {
        let mut locations = HashMap::new();
        let mut subscribers = HashMap::new();
        let mut recv = subscribe(&mut locations, &mut subscribers, 1, "dc1".to_string(), 8, LocationSnapshot::default());
        // drain the opening snapshot
        assert!(matches!(recv.receiver.recv().await, Some(Update::Snapshot(_))));

        publish(
            &locations,
            &subscribers,
            "dc1/rack3",
            Update::TopologyChanged,
        );
        assert!(matches!(recv.receiver.recv().await, Some(Update::TopologyChanged)));
    }

    #[tokio::test]
    async fn close_update_channel_is_idempotent() {
        let mut locations = HashMap::new();
        let mut subscribers = HashMap::new();
        let _recv = subscribe(&mut locations, &mut subscribers, 1, "dc1".to_string(), 8, LocationSnapshot::default());
        unsubscribe(&mut locations, &mut subscribers, 1);
        unsubscribe(&mut locations, &mut subscribers, 1);
        assert!(subscribers.is_empty());
        assert!(locations.is_empty());
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let mut locations = HashMap::new();
        let mut subscribers = HashMap::new();
        let recv = subscribe(&mut locations, &mut subscribers, 1, "".to_string(), 1, LocationSnapshot::default());
        // buffer of depth 1 is already holding the opening snapshot.
        publish(&locations, &subscribers, "dc1", Update::TopologyChanged);
        publish(&locations, &subscribers, "dc1", Update::TopologyChanged);
        assert!(recv.dropped.load(Ordering::Relaxed) >= 1);
    }
}
