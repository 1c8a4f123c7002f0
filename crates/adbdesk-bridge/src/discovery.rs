use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use adbdesk_util::now_millis;

use crate::device::Device;
use crate::error::BridgeError;
use crate::events::{DeviceEvent, DeviceEventKind, EventBus};
use crate::exec::ToolRunner;
use crate::ids::normalize_device_id;
use crate::props::parse_properties;
use crate::registry::{DeviceRegistry, RegistryDelta};

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Delay between the end of one pass and the start of the next.
    pub interval: Duration,
    /// Hard bound on the device-listing call; a hung tool cannot stall
    /// subsequent passes past this.
    pub list_timeout: Duration,
    /// Per-device bound on the property fetch.
    pub prop_timeout: Duration,
    pub fetch_properties: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            list_timeout: Duration::from_secs(10),
            prop_timeout: Duration::from_secs(2),
            fetch_properties: true,
        }
    }
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Periodic device discovery. One task owns the pass loop, so passes are
/// strictly serialized; the registry it writes is read by everyone else
/// through snapshots.
pub struct DiscoveryMonitor {
    runner: Arc<ToolRunner>,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus>,
    config: DiscoveryConfig,
    running: Mutex<Option<RunningLoop>>,
}

impl DiscoveryMonitor {
    pub fn new(
        runner: Arc<ToolRunner>,
        registry: Arc<DeviceRegistry>,
        events: Arc<EventBus>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            runner,
            registry,
            events,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    /// Run a single discovery pass without starting the loop.
    pub async fn pass_once(&self) {
        let mut tool_missing_reported = false;
        run_discovery_pass(
            &self.runner,
            &self.registry,
            &self.events,
            &self.config,
            &mut tool_missing_reported,
        )
        .await;
    }

    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            warn!("device monitoring is already running");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let runner = Arc::clone(&self.runner);
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            let mut tool_missing_reported = false;
            loop {
                run_discovery_pass(
                    &runner,
                    &registry,
                    &events,
                    &config,
                    &mut tool_missing_reported,
                )
                .await;

                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => {}
                    changed = stop_rx.changed() => {
                        // A dropped sender means the monitor is gone; treat
                        // it like a stop rather than spinning passes.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
            debug!("device monitoring loop exited");
        });

        *running = Some(RunningLoop { stop_tx, task });
        info!(interval = ?self.config.interval, "device monitoring started");
    }

    /// Guarantee no further pass starts; an in-flight pass may finish within
    /// its own timeout budget, after which the task is aborted. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().unwrap().take() else {
            return;
        };
        let _ = running.stop_tx.send(true);

        let grace = self.config.list_timeout + self.config.prop_timeout + Duration::from_secs(1);
        match tokio::time::timeout(grace, running.task).await {
            Ok(_) => {}
            Err(_) => {
                warn!("discovery loop did not stop within {grace:?}; aborting");
            }
        }
        info!("device monitoring stopped");
    }
}

async fn run_discovery_pass(
    runner: &ToolRunner,
    registry: &DeviceRegistry,
    events: &EventBus,
    config: &DiscoveryConfig,
    tool_missing_reported: &mut bool,
) {
    let result = match runner.run(["devices"], config.list_timeout).await {
        Ok(result) => result,
        Err(err) => {
            match &err {
                BridgeError::ToolNotFound { .. } => {
                    // Fatal until resolved; surface once, keep polling so the
                    // condition clears itself when the tool appears.
                    if !*tool_missing_reported {
                        error!("{err}");
                        *tool_missing_reported = true;
                    } else {
                        debug!("{err}");
                    }
                }
                _ => warn!("device listing failed: {err}"),
            }
            return;
        }
    };
    *tool_missing_reported = false;

    if !result.success {
        warn!(
            exit_code = result.exit_code,
            stderr = %result.stderr.trim(),
            "device listing reported failure"
        );
        return;
    }

    let seen = parse_device_list(&result.stdout);
    let delta = registry.reconcile(&seen, now_millis());
    publish_delta(events, &delta);

    if config.fetch_properties {
        fetch_online_properties(runner, registry, config, &seen).await;
    }
}

fn publish_delta(events: &EventBus, delta: &RegistryDelta) {
    for device in &delta.added {
        events.publish(DeviceEvent {
            kind: DeviceEventKind::Added,
            device: device.clone(),
        });
    }
    for device in &delta.lost {
        events.publish(DeviceEvent {
            kind: DeviceEventKind::Lost,
            device: device.clone(),
        });
    }
    for device in &delta.changed {
        events.publish(DeviceEvent {
            kind: DeviceEventKind::StateChanged,
            device: device.clone(),
        });
    }
}

/// Fetch `getprop` for every online device concurrently. A failure for one
/// device is logged for that device alone and never aborts the pass.
async fn fetch_online_properties(
    runner: &ToolRunner,
    registry: &DeviceRegistry,
    config: &DiscoveryConfig,
    seen: &[(String, String)],
) {
    let online: Vec<&str> = seen
        .iter()
        .filter(|(_, raw_state)| raw_state == "device")
        .map(|(id, _)| id.as_str())
        .collect();

    let fetches = online.iter().map(|id| async move {
        let result = runner
            .run(["-s", id, "shell", "getprop"], config.prop_timeout)
            .await;
        (*id, result)
    });

    for (id, result) in join_all(fetches).await {
        match result {
            Ok(output) if output.success => {
                let props = parse_properties(&output.stdout);
                if !props.is_empty() {
                    registry.merge_properties(id, props);
                }
            }
            Ok(output) => {
                debug!(device = id, stderr = %output.stderr.trim(), "getprop failed");
            }
            Err(err) => {
                debug!(device = id, "property fetch failed: {err}");
            }
        }
    }
}

/// Parse `adb devices` output into `(id, status)` rows. The header, blank
/// lines and daemon chatter are skipped; malformed rows are logged and
/// dropped, never fatal.
pub fn parse_device_list(output: &str) -> Vec<(String, String)> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with("List of devices attached")
            || line.starts_with('*')
        {
            continue;
        }
        let Some((id, status)) = line.split_once(char::is_whitespace) else {
            warn!(line, "unrecognized device listing row");
            continue;
        };
        let id = normalize_device_id(id);
        let status = status.trim();
        if id.is_empty() || status.is_empty() {
            warn!(line, "unrecognized device listing row");
            continue;
        }
        rows.push((id, status.to_string()));
    }
    rows
}

/// Point-in-time view helper for surfaces that want a plain list.
pub fn sorted_devices(registry: &DeviceRegistry) -> Vec<Device> {
    let snapshot = registry.snapshot();
    let mut devices: Vec<Device> = snapshot.values().cloned().collect();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    devices
}
