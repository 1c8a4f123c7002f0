use std::collections::HashMap;

use serde::Serialize;

use crate::ids::network_address;

pub const PROP_MODEL: &str = "ro.product.model";
pub const PROP_MANUFACTURER: &str = "ro.product.manufacturer";
pub const PROP_OS_VERSION: &str = "ro.build.version.release";
pub const PROP_API_LEVEL: &str = "ro.build.version.sdk";

/// Connection state as reported by the device listing. `Unknown` doubles as
/// the terminal "lost" state for devices that stopped appearing in passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    NoPermissions,
    Unknown,
}

impl DeviceState {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            "no permissions" => DeviceState::NoPermissions,
            _ => DeviceState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Device => "device",
            DeviceState::Offline => "offline",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::NoPermissions => "no permissions",
            DeviceState::Unknown => "unknown",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceState::Device)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Usb,
    Network,
}

/// One known device. Created on first sighting, mutated in place by later
/// discovery passes, never deleted while the process lives.
#[derive(Clone, Debug, Serialize)]
pub struct Device {
    pub id: String,
    pub state: DeviceState,
    /// Raw status string from the last pass that saw this device, kept for
    /// display of states the closed enum folds into `Unknown`.
    pub raw_state: String,
    pub kind: ConnectionKind,
    pub ip_address: Option<String>,
    pub last_seen_unix_millis: i64,
    pub properties: HashMap<String, String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub os_version: Option<String>,
    pub api_level: Option<String>,
}

impl Device {
    pub fn new(id: &str, raw_state: &str, now_millis: i64) -> Self {
        let ip_address = network_address(id).map(str::to_string);
        let kind = if ip_address.is_some() {
            ConnectionKind::Network
        } else {
            ConnectionKind::Usb
        };
        Self {
            id: id.to_string(),
            state: DeviceState::from_raw(raw_state),
            raw_state: raw_state.trim().to_string(),
            kind,
            ip_address,
            last_seen_unix_millis: now_millis,
            properties: HashMap::new(),
            model: None,
            manufacturer: None,
            os_version: None,
            api_level: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    pub(crate) fn apply_state(&mut self, raw_state: &str, now_millis: i64) -> bool {
        let next = DeviceState::from_raw(raw_state);
        let changed = next != self.state;
        self.state = next;
        self.raw_state = raw_state.trim().to_string();
        self.last_seen_unix_millis = now_millis;
        changed
    }

    pub(crate) fn mark_lost(&mut self) {
        self.state = DeviceState::Unknown;
        self.raw_state = "unknown".to_string();
    }

    /// Merge a freshly fetched property map and refresh derived display
    /// fields. Only called while the device is online.
    pub(crate) fn merge_properties(&mut self, props: HashMap<String, String>) {
        for (key, value) in props {
            self.properties.insert(key, value);
        }
        self.model = self.properties.get(PROP_MODEL).cloned();
        self.manufacturer = self.properties.get(PROP_MANUFACTURER).cloned();
        self.os_version = self.properties.get(PROP_OS_VERSION).cloned();
        self.api_level = self.properties.get(PROP_API_LEVEL).cloned();
    }

    pub fn display_name(&self) -> String {
        match &self.model {
            Some(model) => format!("{model} ({})", self.id),
            None => self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_serial_is_classified_usb() {
        let device = Device::new("ABCD1234", "device", 0);
        assert_eq!(device.kind, ConnectionKind::Usb);
        assert_eq!(device.ip_address, None);
        assert!(device.is_online());
    }

    #[test]
    fn single_colon_id_is_network_with_ip() {
        let device = Device::new("192.168.1.5:5555", "device", 0);
        assert_eq!(device.kind, ConnectionKind::Network);
        assert_eq!(device.ip_address.as_deref(), Some("192.168.1.5"));
    }

    #[test]
    fn multi_colon_id_is_not_network() {
        let device = Device::new("odd:id:extra", "device", 0);
        assert_eq!(device.kind, ConnectionKind::Usb);
    }

    #[test]
    fn raw_states_map_verbatim() {
        assert_eq!(DeviceState::from_raw("device"), DeviceState::Device);
        assert_eq!(DeviceState::from_raw("offline"), DeviceState::Offline);
        assert_eq!(
            DeviceState::from_raw("unauthorized"),
            DeviceState::Unauthorized
        );
        assert_eq!(
            DeviceState::from_raw("no permissions"),
            DeviceState::NoPermissions
        );
        assert_eq!(DeviceState::from_raw("recovery"), DeviceState::Unknown);
    }

    #[test]
    fn merge_properties_refreshes_display_fields() {
        let mut device = Device::new("ABCD1234", "device", 0);
        let mut props = HashMap::new();
        props.insert(PROP_MODEL.to_string(), "Pixel 7".to_string());
        props.insert(PROP_API_LEVEL.to_string(), "33".to_string());
        device.merge_properties(props);
        assert_eq!(device.model.as_deref(), Some("Pixel 7"));
        assert_eq!(device.api_level.as_deref(), Some("33"));
        assert_eq!(device.display_name(), "Pixel 7 (ABCD1234)");
    }
}
