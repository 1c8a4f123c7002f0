mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use adbdesk_bridge::discovery::sorted_devices;
use adbdesk_bridge::logcat::{
    FilterConfig, Level, LevelSet, LogBuffer, LogFormat, LogStreamWorker, StartOptions,
    StreamUpdate,
};
use adbdesk_bridge::props::serialize_properties;
use adbdesk_bridge::{
    CommandSession, DeviceEventKind, DeviceRegistry, DiscoveryConfig, DiscoveryMonitor, EventBus,
    ToolRunner,
};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "adbdesk", version, about = "Desktop bridge to Android devices")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List connected devices from a single discovery pass
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Monitor device connections until interrupted
    Watch {
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Run a tool command against a device
    Run {
        #[arg(long, short)]
        device: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Run a remote shell command on a device
    Shell {
        #[arg(long, short)]
        device: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Print a device's property block
    Props {
        #[arg(long, short)]
        device: Option<String>,
    },
    /// Stream device logs until interrupted
    Logcat {
        #[arg(long, short)]
        device: Option<String>,
        /// Output format: brief, process, tag, raw, time, threadtime, long
        #[arg(long)]
        format: Option<String>,
        /// Buffer to read: main, system, radio, events, crash, all (repeatable)
        #[arg(long = "buffer")]
        buffers: Vec<String>,
        /// Minimum severity: V, D, I, W, E, F
        #[arg(long)]
        min_level: Option<String>,
        /// Case-insensitive substring filter over tag and message
        #[arg(long)]
        search: Option<String>,
        /// Only lines whose tag contains this text
        #[arg(long)]
        tag: Option<String>,
        /// Keyword to mark in matching lines (repeatable)
        #[arg(long = "highlight")]
        highlights: Vec<String>,
        /// Clear the device-side buffers and exit
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    adbdesk_util::init_tracing()?;
    let cli = Cli::parse();
    let mut cfg = CliConfig::load();
    let runner = Arc::new(ToolRunner::from_env());

    match cli.cmd {
        Cmd::Devices { json } => {
            let registry = Arc::new(DeviceRegistry::new());
            let monitor = DiscoveryMonitor::new(
                Arc::clone(&runner),
                Arc::clone(&registry),
                Arc::new(EventBus::new()),
                DiscoveryConfig::default(),
            );
            monitor.pass_once().await;

            let devices = sorted_devices(&registry);
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                for device in devices {
                    println!(
                        "{}\t{}\t{}\t{}",
                        device.id,
                        device.state.as_str(),
                        match device.kind {
                            adbdesk_bridge::ConnectionKind::Usb => "usb",
                            adbdesk_bridge::ConnectionKind::Network => "network",
                        },
                        device.display_name(),
                    );
                }
            }
        }

        Cmd::Watch { interval_secs } => {
            let registry = Arc::new(DeviceRegistry::new());
            let events = Arc::new(EventBus::new());
            let mut rx = events.subscribe();
            let monitor = DiscoveryMonitor::new(
                Arc::clone(&runner),
                Arc::clone(&registry),
                Arc::clone(&events),
                DiscoveryConfig {
                    interval: Duration::from_secs(
                        interval_secs.unwrap_or(cfg.monitor_interval_secs),
                    ),
                    ..DiscoveryConfig::default()
                },
            );
            monitor.start();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            let verb = match event.kind {
                                DeviceEventKind::Added => "added",
                                DeviceEventKind::Lost => "lost",
                                DeviceEventKind::StateChanged => "changed",
                            };
                            println!(
                                "{verb}\t{}\t{}",
                                event.device.id,
                                event.device.state.as_str()
                            );
                        }
                        None => break,
                    }
                }
            }
            monitor.stop().await;
        }

        Cmd::Run {
            device,
            timeout_secs,
            command,
        } => {
            let device = resolve_device(device, &mut cfg)?;
            let session = CommandSession::new(Arc::clone(&runner), device)
                .with_timeout(Duration::from_secs(cfg.command_timeout_secs));
            let result = session
                .execute(
                    &command.join(" "),
                    timeout_secs.map(Duration::from_secs),
                )
                .await?;
            print_result(&result);
            std::process::exit(if result.success { 0 } else { 1 });
        }

        Cmd::Shell {
            device,
            timeout_secs,
            command,
        } => {
            let device = resolve_device(device, &mut cfg)?;
            let session = CommandSession::new(Arc::clone(&runner), device)
                .with_timeout(Duration::from_secs(cfg.command_timeout_secs));
            let result = session
                .execute_shell(
                    &command.join(" "),
                    timeout_secs.map(Duration::from_secs),
                )
                .await?;
            print_result(&result);
            std::process::exit(if result.success { 0 } else { 1 });
        }

        Cmd::Props { device } => {
            let device = resolve_device(device, &mut cfg)?;
            let session = CommandSession::new(Arc::clone(&runner), device);
            let props = session.get_properties().await?;
            print!("{}", serialize_properties(&props));
        }

        Cmd::Logcat {
            device,
            format,
            buffers,
            min_level,
            search,
            tag,
            highlights,
            clear,
        } => {
            let device = resolve_device(device, &mut cfg)?;
            let worker = LogStreamWorker::new(Arc::clone(&runner), device);

            if clear {
                let result = worker.clear().await?;
                if !result.success {
                    eprintln!("clear failed: {}", result.stderr.trim());
                    std::process::exit(1);
                }
                return Ok(());
            }

            let format = parse_format(format.as_deref().unwrap_or(&cfg.log_format))?;
            let buffer_names = if buffers.is_empty() {
                cfg.log_buffers.clone()
            } else {
                buffers
            };
            let buffers = buffer_names
                .iter()
                .map(|name| parse_buffer(name))
                .collect::<Result<Vec<_>, _>>()?;

            let highlight_keywords = if highlights.is_empty() {
                cfg.highlight_keywords.clone()
            } else {
                highlights
            };
            worker.set_filter(FilterConfig {
                enabled_levels: match min_level.as_deref() {
                    Some(code) => min_level_set(code)?,
                    None => LevelSet::all(),
                },
                tag_filter: tag,
                search_text: search,
                highlight_keywords,
            });

            let lines = worker.start(StartOptions {
                format,
                buffers,
                ..StartOptions::default()
            })?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    update = lines.next_batch() => match update {
                        StreamUpdate::Batch { lines, dropped } => {
                            if dropped > 0 {
                                eprintln!("... {dropped} lines dropped ...");
                            }
                            for line in lines {
                                if line.highlights.is_empty() {
                                    println!("{}", line.raw);
                                } else {
                                    println!("* {}", line.raw);
                                }
                            }
                        }
                        StreamUpdate::Ended(end) => {
                            eprintln!("log stream ended: {end:?}");
                            break;
                        }
                    }
                }
            }
            worker.stop().await;
        }
    }

    Ok(())
}

fn resolve_device(
    flag: Option<String>,
    cfg: &mut CliConfig,
) -> Result<String, Box<dyn std::error::Error>> {
    let device = match flag {
        Some(device) if !device.is_empty() => device,
        _ if !cfg.last_device.is_empty() => cfg.last_device.clone(),
        _ => return Err("no device given; pass --device or set ADBDESK_DEVICE".into()),
    };
    if cfg.last_device != device {
        cfg.last_device = device.clone();
        if let Err(err) = cfg.save() {
            eprintln!("Failed to save config: {err}");
        }
    }
    Ok(device)
}

fn print_result(result: &adbdesk_bridge::ExecutionResult) {
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
}

fn parse_format(name: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "brief" => LogFormat::Brief,
        "process" => LogFormat::Process,
        "tag" => LogFormat::Tag,
        "raw" => LogFormat::Raw,
        "time" => LogFormat::Time,
        "threadtime" => LogFormat::Threadtime,
        "long" => LogFormat::Long,
        other => return Err(format!("unknown log format: {other}").into()),
    })
}

fn parse_buffer(name: &str) -> Result<LogBuffer, Box<dyn std::error::Error>> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "main" => LogBuffer::Main,
        "system" => LogBuffer::System,
        "radio" => LogBuffer::Radio,
        "events" => LogBuffer::Events,
        "crash" => LogBuffer::Crash,
        "all" => LogBuffer::All,
        other => return Err(format!("unknown log buffer: {other}").into()),
    })
}

fn min_level_set(code: &str) -> Result<LevelSet, Box<dyn std::error::Error>> {
    let code = code.trim().to_ascii_uppercase();
    let min = match code.as_str() {
        "V" => Level::Verbose,
        "D" => Level::Debug,
        "I" => Level::Info,
        "W" => Level::Warn,
        "E" => Level::Error,
        "F" => Level::Fatal,
        other => return Err(format!("unknown level: {other}").into()),
    };
    // Unknown sorts above Fatal, so unparseable lines stay visible at any
    // threshold.
    let levels: Vec<Level> = Level::ALL
        .into_iter()
        .filter(|level| *level >= min)
        .collect();
    Ok(LevelSet::only(&levels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_level_keeps_unknown_visible() {
        let set = min_level_set("E").unwrap();
        assert!(set.contains(Level::Error));
        assert!(set.contains(Level::Fatal));
        assert!(set.contains(Level::Unknown));
        assert!(!set.contains(Level::Warn));
    }

    #[test]
    fn format_names_round_trip() {
        for name in ["brief", "process", "tag", "raw", "time", "threadtime", "long"] {
            assert_eq!(parse_format(name).unwrap().as_arg(), name);
        }
        assert!(parse_format("xml").is_err());
    }

    #[test]
    fn buffer_names_round_trip() {
        for name in ["main", "system", "radio", "events", "crash", "all"] {
            assert_eq!(parse_buffer(name).unwrap().as_arg(), name);
        }
        assert!(parse_buffer("kernel").is_err());
    }
}
