//! Viewer settings: clap schema, persisted user overrides, precedence rules.
//!
//! Three layers, applied in strict order: built-in defaults, then the user
//! settings file, then command-line flags. The command line always wins, so
//! file values are only applied for flags the user did not pass explicitly.

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::error::ConfigError;

pub const DEFAULT_WATCHDOG_TIMEOUT_SECS: f32 = 20.0;
pub const MIN_BACKGROUND_YIELD_MS: u64 = 0;
pub const MAX_BACKGROUND_YIELD_MS: u64 = 1000;
/// Radius of the local text-chat bubble, in meters.
pub const DEFAULT_CHAT_RADIUS_M: f32 = 20.0;

const USER_SETTINGS_FILE: &str = "settings.toml";
const CRASH_SETTINGS_FILE: &str = "crash.toml";
const CONFIG_DIR_ENV: &str = "GRIDVIEW_CONFIG_DIR";
const DATA_DIR_ENV: &str = "GRIDVIEW_DATA_DIR";

#[derive(Debug, Parser, Clone)]
#[command(name = "gridview", about = "Virtual-world viewer client core", author, version)]
pub struct AppConfig {
    /// Write a JSON session log (rotated to .old on startup)
    #[arg(long = "logs", default_value_t = true, action = ArgAction::Set)]
    pub logs: bool,

    /// Hard off-switch for all file logging
    #[arg(long = "no-logs", default_value_t = false)]
    pub no_logs: bool,

    /// Enable the main-loop watchdog
    #[arg(long = "watchdog", default_value_t = true, action = ArgAction::Set)]
    pub watchdog: bool,

    /// Seconds without a watchdog ping before the session is declared hung
    #[arg(
        long = "watchdog-timeout-secs",
        default_value_t = DEFAULT_WATCHDOG_TIMEOUT_SECS,
        value_parser = parse_watchdog_timeout
    )]
    pub watchdog_timeout_secs: f32,

    /// Allow more than one viewer instance against the same install
    #[arg(long = "allow-multiple-instances", default_value_t = false)]
    pub allow_multiple_instances: bool,

    /// Let background workers run concurrently with rendering
    #[arg(long = "run-multiple-threads", default_value_t = false)]
    pub run_multiple_threads: bool,

    /// Run the texture cache worker
    #[arg(long = "texture-cache", default_value_t = true, action = ArgAction::Set)]
    pub texture_cache: bool,

    /// Run the image decode worker
    #[arg(long = "image-decode", default_value_t = true, action = ArgAction::Set)]
    pub image_decode: bool,

    /// Run the texture fetch worker
    #[arg(long = "texture-fetch", default_value_t = true, action = ArgAction::Set)]
    pub texture_fetch: bool,

    /// Milliseconds yielded to the OS every frame (-1 disables)
    #[arg(long = "yield-time-ms", default_value_t = -1)]
    pub yield_time_ms: i64,

    /// Sleep while the window is hidden or unfocused (ms, 0-1000)
    #[arg(
        long = "background-yield-ms",
        default_value_t = 40,
        value_parser = parse_background_yield
    )]
    pub background_yield_ms: u64,

    /// Force-quit after this many seconds of runtime (0 disables)
    #[arg(long = "quit-after-seconds", default_value_t = 0.0)]
    pub quit_after_seconds: f32,

    /// Local cache budget in megabytes
    #[arg(long = "cache-size-mb", default_value_t = 512)]
    pub cache_size_mb: u32,

    /// Local chat radius used by the proximity speaker scan (meters)
    #[arg(long = "chat-radius-m", default_value_t = DEFAULT_CHAT_RADIUS_M)]
    pub chat_radius_m: f32,

    /// Enable the debug memory-leak simulator
    #[arg(long = "mem-leak-sim", default_value_t = false)]
    pub mem_leak_sim: bool,
}

fn parse_watchdog_timeout(raw: &str) -> Result<f32, String> {
    let value: f32 = raw
        .parse()
        .map_err(|_| format!("invalid watchdog timeout '{raw}'"))?;
    if !(1.0..=600.0).contains(&value) {
        return Err("watchdog timeout must be between 1 and 600 seconds".to_string());
    }
    Ok(value)
}

fn parse_background_yield(raw: &str) -> Result<u64, String> {
    let value: u64 = raw
        .parse()
        .map_err(|_| format!("invalid background yield '{raw}'"))?;
    if !(MIN_BACKGROUND_YIELD_MS..=MAX_BACKGROUND_YIELD_MS).contains(&value) {
        return Err(format!(
            "background yield must be between {MIN_BACKGROUND_YIELD_MS} and {MAX_BACKGROUND_YIELD_MS} ms"
        ));
    }
    Ok(value)
}

/// Resolve the config directory, honoring the env override first.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    directories::ProjectDirs::from("org", "gridview", "gridview")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Resolve the data directory (marker files, caches), honoring the env override.
pub fn data_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    directories::ProjectDirs::from("org", "gridview", "gridview")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

/// Persisted user preferences that survive across sessions.
///
/// All fields optional; absent keys leave the built-in default in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub logs: Option<bool>,
    pub watchdog: Option<bool>,
    pub watchdog_timeout_secs: Option<f32>,
    pub allow_multiple_instances: Option<bool>,
    pub run_multiple_threads: Option<bool>,
    pub background_yield_ms: Option<u64>,
    pub quit_after_seconds: Option<f32>,
    pub cache_size_mb: Option<u32>,
    pub chat_radius_m: Option<f32>,
}

pub fn user_settings_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(USER_SETTINGS_FILE))
}

/// Load the user settings file. A missing file is a clean default; a file
/// that exists but does not parse is a startup-fatal configuration error.
pub fn load_user_settings() -> Result<UserSettings, ConfigError> {
    let Some(path) = user_settings_path() else {
        return Err(ConfigError::NoSettingsDir);
    };
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(UserSettings::default());
        }
        Err(err) => {
            return Err(ConfigError::Unreadable { path, source: err });
        }
    };
    toml::from_str(&contents).map_err(|err| ConfigError::Corrupt {
        path,
        reason: err.to_string(),
    })
}

pub fn save_user_settings(settings: &UserSettings) {
    let Some(path) = user_settings_path() else {
        tracing::debug!("user settings: cannot resolve settings path");
        return;
    };
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            tracing::debug!("user settings: failed to create {}: {err}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(settings) {
        Ok(body) => {
            if let Err(err) = fs::write(&path, body) {
                tracing::debug!("user settings: failed to write {}: {err}", path.display());
            }
        }
        Err(err) => tracing::debug!("user settings: serialize failed: {err}"),
    }
}

/// Tracks which CLI flags were explicitly provided, so file values never
/// override an explicit command-line choice.
#[derive(Debug, Clone, Default)]
pub struct CliExplicitFlags {
    pub logs: bool,
    pub watchdog: bool,
    pub watchdog_timeout_secs: bool,
    pub allow_multiple_instances: bool,
    pub run_multiple_threads: bool,
    pub background_yield_ms: bool,
    pub quit_after_seconds: bool,
    pub cache_size_mb: bool,
    pub chat_radius_m: bool,
}

fn cli_flag_present(args: &[String], long_name: &str) -> bool {
    let exact = format!("--{long_name}");
    let with_value = format!("{exact}=");
    args.iter()
        .any(|arg| arg == &exact || arg.starts_with(&with_value))
}

pub(crate) fn detect_explicit_flags_with_args(args: &[String]) -> CliExplicitFlags {
    CliExplicitFlags {
        logs: cli_flag_present(args, "logs"),
        watchdog: cli_flag_present(args, "watchdog"),
        watchdog_timeout_secs: cli_flag_present(args, "watchdog-timeout-secs"),
        allow_multiple_instances: cli_flag_present(args, "allow-multiple-instances"),
        run_multiple_threads: cli_flag_present(args, "run-multiple-threads"),
        background_yield_ms: cli_flag_present(args, "background-yield-ms"),
        quit_after_seconds: cli_flag_present(args, "quit-after-seconds"),
        cache_size_mb: cli_flag_present(args, "cache-size-mb"),
        chat_radius_m: cli_flag_present(args, "chat-radius-m"),
    }
}

/// Detect which CLI flags were explicitly provided on this process's args.
pub fn detect_explicit_flags() -> CliExplicitFlags {
    let args: Vec<String> = env::args().skip(1).collect();
    detect_explicit_flags_with_args(&args)
}

/// Apply file values underneath explicit CLI flags.
pub fn apply_user_settings(
    config: &mut AppConfig,
    settings: &UserSettings,
    cli_explicit: &CliExplicitFlags,
) {
    if !cli_explicit.logs {
        if let Some(v) = settings.logs {
            config.logs = v;
        }
    }
    if !cli_explicit.watchdog {
        if let Some(v) = settings.watchdog {
            config.watchdog = v;
        }
    }
    if !cli_explicit.watchdog_timeout_secs {
        if let Some(v) = settings.watchdog_timeout_secs {
            config.watchdog_timeout_secs = v.clamp(1.0, 600.0);
        }
    }
    if !cli_explicit.allow_multiple_instances {
        if let Some(v) = settings.allow_multiple_instances {
            config.allow_multiple_instances = v;
        }
    }
    if !cli_explicit.run_multiple_threads {
        if let Some(v) = settings.run_multiple_threads {
            config.run_multiple_threads = v;
        }
    }
    if !cli_explicit.background_yield_ms {
        if let Some(v) = settings.background_yield_ms {
            config.background_yield_ms = v.clamp(MIN_BACKGROUND_YIELD_MS, MAX_BACKGROUND_YIELD_MS);
        }
    }
    if !cli_explicit.quit_after_seconds {
        if let Some(v) = settings.quit_after_seconds {
            config.quit_after_seconds = v.max(0.0);
        }
    }
    if !cli_explicit.cache_size_mb {
        if let Some(v) = settings.cache_size_mb {
            config.cache_size_mb = v;
        }
    }
    if !cli_explicit.chat_radius_m {
        if let Some(v) = settings.chat_radius_m {
            config.chat_radius_m = v.max(0.0);
        }
    }
}

/// Crash-behavior state persisted across launches.
///
/// `gl_init_pending` is written *before* window/GL bring-up is attempted and
/// cleared only after it succeeds, so a crash inside the driver is visible on
/// the next launch even without a live crash handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashSettings {
    #[serde(default)]
    pub gl_init_pending: bool,
}

pub fn crash_settings_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CRASH_SETTINGS_FILE))
}

pub fn load_crash_settings() -> CrashSettings {
    let Some(path) = crash_settings_path() else {
        return CrashSettings::default();
    };
    let Ok(contents) = fs::read_to_string(&path) else {
        return CrashSettings::default();
    };
    toml::from_str(&contents).unwrap_or_default()
}

pub fn save_crash_settings(settings: &CrashSettings) {
    let Some(path) = crash_settings_path() else {
        return;
    };
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    if let Ok(body) = toml::to_string(settings) {
        let _ = fs::write(&path, body);
    }
}
