use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::device::Device;

pub type RegistrySnapshot = Arc<HashMap<String, Device>>;

/// What one discovery pass changed, as immutable device snapshots.
#[derive(Clone, Debug, Default)]
pub struct RegistryDelta {
    pub added: Vec<Device>,
    pub lost: Vec<Device>,
    pub changed: Vec<Device>,
}

impl RegistryDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.lost.is_empty() && self.changed.is_empty()
    }
}

/// In-memory table of every device ever sighted. Written only by the
/// discovery loop; everyone else reads immutable snapshots through a watch
/// channel, so no reader ever blocks the writer or another reader.
pub struct DeviceRegistry {
    snapshot_tx: watch::Sender<RegistrySnapshot>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(HashMap::new()));
        Self { snapshot_tx }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Change-driven reads for consumers that want to react to every pass.
    pub fn watch(&self) -> watch::Receiver<RegistrySnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.snapshot_tx.borrow().get(id).cloned()
    }

    /// Apply one discovery pass. Ids seen for the first time are added; ids
    /// absent from the pass are marked lost (state unknown) but kept so the
    /// surface can still show them; status changes are updated in place.
    pub fn reconcile(&self, seen: &[(String, String)], now_millis: i64) -> RegistryDelta {
        let mut next: HashMap<String, Device> = (*self.snapshot_tx.borrow().clone()).clone();
        let mut delta = RegistryDelta::default();

        for (id, raw_state) in seen {
            match next.get_mut(id) {
                Some(device) => {
                    if device.apply_state(raw_state, now_millis) {
                        delta.changed.push(device.clone());
                    }
                }
                None => {
                    let device = Device::new(id, raw_state, now_millis);
                    delta.added.push(device.clone());
                    next.insert(id.clone(), device);
                }
            }
        }

        for (id, device) in next.iter_mut() {
            if seen.iter().any(|(seen_id, _)| seen_id == id) {
                continue;
            }
            if device.state != crate::device::DeviceState::Unknown {
                device.mark_lost();
                delta.lost.push(device.clone());
            }
        }

        self.snapshot_tx.send_replace(Arc::new(next));
        delta
    }

    /// Merge fetched properties into one device; returns the updated
    /// snapshot, or `None` if the device is gone or no longer online.
    pub fn merge_properties(
        &self,
        id: &str,
        props: HashMap<String, String>,
    ) -> Option<Device> {
        let mut next: HashMap<String, Device> = (*self.snapshot_tx.borrow().clone()).clone();
        let device = next.get_mut(id)?;
        if !device.is_online() {
            return None;
        }
        device.merge_properties(props);
        let updated = device.clone();
        self.snapshot_tx.send_replace(Arc::new(next));
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;

    fn pass(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(id, state)| (id.to_string(), state.to_string()))
            .collect()
    }

    #[test]
    fn first_pass_adds_every_row() {
        let registry = DeviceRegistry::new();
        let delta = registry.reconcile(&pass(&[("A", "device"), ("B", "offline")]), 1);
        assert_eq!(delta.added.len(), 2);
        assert!(delta.lost.is_empty());
        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.get("B").unwrap().state, DeviceState::Offline);
    }

    #[test]
    fn missing_devices_are_marked_lost_not_deleted() {
        let registry = DeviceRegistry::new();
        registry.reconcile(&pass(&[("A", "device"), ("B", "device")]), 1);
        let delta = registry.reconcile(&pass(&[("A", "device"), ("C", "offline")]), 2);

        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].id, "C");
        assert_eq!(delta.lost.len(), 1);
        assert_eq!(delta.lost[0].id, "B");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["A"].state, DeviceState::Device);
        assert_eq!(snapshot["B"].state, DeviceState::Unknown);
        assert_eq!(snapshot["C"].state, DeviceState::Offline);
    }

    #[test]
    fn status_change_is_reported_once() {
        let registry = DeviceRegistry::new();
        registry.reconcile(&pass(&[("A", "device")]), 1);
        let delta = registry.reconcile(&pass(&[("A", "unauthorized")]), 2);
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].state, DeviceState::Unauthorized);

        let delta = registry.reconcile(&pass(&[("A", "unauthorized")]), 3);
        assert!(delta.is_empty());
    }

    #[test]
    fn lost_device_coming_back_counts_as_changed() {
        let registry = DeviceRegistry::new();
        registry.reconcile(&pass(&[("A", "device")]), 1);
        registry.reconcile(&pass(&[]), 2);
        assert_eq!(registry.get("A").unwrap().state, DeviceState::Unknown);

        let delta = registry.reconcile(&pass(&[("A", "device")]), 3);
        assert_eq!(delta.changed.len(), 1);
        assert!(delta.changed[0].is_online());
    }

    #[test]
    fn properties_merge_only_while_online() {
        let registry = DeviceRegistry::new();
        registry.reconcile(&pass(&[("A", "device"), ("B", "offline")]), 1);

        let mut props = HashMap::new();
        props.insert("ro.product.model".to_string(), "Pixel 7".to_string());
        let updated = registry.merge_properties("A", props.clone()).unwrap();
        assert_eq!(updated.model.as_deref(), Some("Pixel 7"));
        assert!(registry.merge_properties("B", props).is_none());
    }

    #[test]
    fn readers_keep_their_snapshot_across_writes() {
        let registry = DeviceRegistry::new();
        registry.reconcile(&pass(&[("A", "device")]), 1);
        let before = registry.snapshot();
        registry.reconcile(&pass(&[]), 2);
        assert_eq!(before["A"].state, DeviceState::Device);
        assert_eq!(registry.snapshot()["A"].state, DeviceState::Unknown);
    }
}
