use std::path::{Path, PathBuf};

use disk_tunnel_summary_model::EnginePolicy;
use serde::Deserialize;

/// Facts about the host that change how fio has to be invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub in_container: bool,
    pub in_wsl: bool,
}

impl Platform {
    pub fn detect() -> Self {
        let in_container =
            Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists();
        let in_wsl = std::fs::read_to_string("/proc/version")
            .map(|v| v.to_lowercase().contains("microsoft"))
            .unwrap_or(false);

        Self {
            os: std::env::consts::OS,
            in_container,
            in_wsl,
        }
    }
}

/// Operator overrides for the automatic choices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub ioengine: Option<String>,
    pub direct_io: Option<bool>,
    pub thread_mode: Option<bool>,
}

/// Decide how fio should be invoked on this platform.
///
/// fio's default process mode allocates SysV shared memory for job state, which fails with
/// spurious `shmget` errors inside containers, under WSL and on macOS. Those environments use
/// thread mode instead. Every decision is explained in [EnginePolicy::notes].
pub fn select_policy(
    engine_path: PathBuf,
    engine_version: Option<String>,
    platform: &Platform,
    overrides: &PolicyOverrides,
) -> EnginePolicy {
    let mut notes = Vec::new();

    let ioengine = match &overrides.ioengine {
        Some(ioengine) => {
            notes.push(format!("ioengine {ioengine} set by configuration"));
            ioengine.clone()
        }
        None => {
            let ioengine = match platform.os {
                "linux" => "libaio",
                "macos" => "posixaio",
                "windows" => "windowsaio",
                _ => "psync",
            };
            notes.push(format!("ioengine {ioengine} selected for {}", platform.os));
            ioengine.to_string()
        }
    };

    let direct_io = match overrides.direct_io {
        Some(direct_io) => {
            notes.push(format!("direct I/O {} by configuration", on_off(direct_io)));
            direct_io
        }
        None if platform.os == "macos" => {
            notes.push("direct I/O off, O_DIRECT is not supported on macOS".to_string());
            false
        }
        None => true,
    };

    let thread_mode = match overrides.thread_mode {
        Some(thread_mode) => {
            notes.push(format!("thread mode {} by configuration", on_off(thread_mode)));
            thread_mode
        }
        None if platform.in_container => {
            notes.push("thread mode on, shared memory is unreliable in containers".to_string());
            true
        }
        None if platform.in_wsl => {
            notes.push("thread mode on, shared memory is unreliable under WSL".to_string());
            true
        }
        None if platform.os == "macos" => {
            notes.push("thread mode on, SysV shared memory limits on macOS are too low".to_string());
            true
        }
        None => false,
    };

    EnginePolicy {
        engine_path,
        engine_version,
        ioengine,
        direct_io,
        thread_mode,
        notes,
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
