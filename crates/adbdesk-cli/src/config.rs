use std::io;

use serde::{Deserialize, Serialize};

use adbdesk_util::{state_file_path, write_json_atomic};

const CLI_CONFIG_FILE: &str = "cli-config.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct CliConfig {
    /// Device used when no `--device` is given.
    pub(crate) last_device: String,
    pub(crate) command_timeout_secs: u64,
    pub(crate) monitor_interval_secs: u64,
    pub(crate) log_format: String,
    pub(crate) log_buffers: Vec<String>,
    pub(crate) highlight_keywords: Vec<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            last_device: String::new(),
            command_timeout_secs: 30,
            monitor_interval_secs: 5,
            log_format: "threadtime".into(),
            log_buffers: Vec::new(),
            highlight_keywords: Vec::new(),
        }
    }
}

impl CliConfig {
    pub(crate) fn load() -> Self {
        let mut cfg = CliConfig::default();
        let path = state_file_path(CLI_CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<CliConfig>(&data) {
                Ok(file_cfg) => {
                    cfg = file_cfg;
                    if let Ok(device) = std::env::var("ADBDESK_DEVICE") {
                        if !device.is_empty() {
                            cfg.last_device = device;
                        }
                    }
                }
                Err(err) => {
                    eprintln!("Failed to parse {}: {err}", path.display());
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    eprintln!("Failed to read {}: {err}", path.display());
                }
                if let Ok(device) = std::env::var("ADBDESK_DEVICE") {
                    cfg.last_device = device;
                }
            }
        }
        cfg
    }

    pub(crate) fn save(&self) -> io::Result<()> {
        write_json_atomic(&state_file_path(CLI_CONFIG_FILE), self)
    }
}
