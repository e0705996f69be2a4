use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "keytrack.toml";

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub host: String,
    pub backend_entrypoint: PathBuf,
    pub backend_args: Vec<String>,
    pub debug: bool,
    pub open_browser: bool,
    pub probe_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Silence on the socket longer than this counts as heartbeat loss.
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_max: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub command_timeout: Duration,
    pub startup_grace: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            backend_entrypoint: PathBuf::from("python3"),
            backend_args: vec!["python/my_app.py".into()],
            debug: false,
            open_browser: false,
            probe_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 3,
            reconnect_backoff: Duration::from_millis(250),
            reconnect_backoff_max: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            startup_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    host: Option<String>,
    backend_entrypoint: Option<PathBuf>,
    backend_args: Option<Vec<String>>,
    debug: Option<bool>,
    open_browser: Option<bool>,
    probe_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    connect_attempts: Option<u32>,
    reconnect_backoff_ms: Option<u64>,
    reconnect_backoff_max_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    command_timeout_ms: Option<u64>,
    startup_grace_ms: Option<u64>,
}

pub fn load_settings() -> ControllerSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file at `path` if it exists, then environment
/// overrides looked up through `env`.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ControllerSettings {
    let mut settings = ControllerSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<SettingsFile>(&raw) {
            Ok(file_cfg) => settings.apply_file(file_cfg),
            Err(error) => warn!(
                path = %path.display(),
                %error,
                "config: ignoring unreadable settings file"
            ),
        }
    }

    settings.apply_env(&env);
    settings.connect_attempts = settings.connect_attempts.max(1);
    settings
}

impl ControllerSettings {
    fn apply_file(&mut self, file_cfg: SettingsFile) {
        if let Some(v) = file_cfg.host {
            self.host = v;
        }
        if let Some(v) = file_cfg.backend_entrypoint {
            self.backend_entrypoint = v;
        }
        if let Some(v) = file_cfg.backend_args {
            self.backend_args = v;
        }
        if let Some(v) = file_cfg.debug {
            self.debug = v;
        }
        if let Some(v) = file_cfg.open_browser {
            self.open_browser = v;
        }
        set_millis(&mut self.probe_timeout, file_cfg.probe_timeout_ms);
        set_millis(&mut self.heartbeat_interval, file_cfg.heartbeat_interval_ms);
        set_millis(&mut self.heartbeat_timeout, file_cfg.heartbeat_timeout_ms);
        set_millis(&mut self.connect_timeout, file_cfg.connect_timeout_ms);
        if let Some(v) = file_cfg.connect_attempts {
            self.connect_attempts = v;
        }
        set_millis(&mut self.reconnect_backoff, file_cfg.reconnect_backoff_ms);
        set_millis(
            &mut self.reconnect_backoff_max,
            file_cfg.reconnect_backoff_max_ms,
        );
        set_millis(&mut self.poll_interval, file_cfg.poll_interval_ms);
        set_millis(&mut self.request_timeout, file_cfg.request_timeout_ms);
        set_millis(&mut self.command_timeout, file_cfg.command_timeout_ms);
        set_millis(&mut self.startup_grace, file_cfg.startup_grace_ms);
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| {
            env(&format!("APP__{name}")).or_else(|| env(&format!("KEYTRACK_{name}")))
        };

        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("BACKEND_ENTRYPOINT") {
            self.backend_entrypoint = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKEND_ARGS") {
            self.backend_args = v.split_whitespace().map(str::to_owned).collect();
        }
        if let Some(v) = lookup("DEBUG").as_deref().and_then(parse_flag) {
            self.debug = v;
        }
        if let Some(v) = lookup("OPEN_BROWSER").as_deref().and_then(parse_flag) {
            self.open_browser = v;
        }
        set_millis(&mut self.probe_timeout, parse_u64(lookup("PROBE_TIMEOUT_MS")));
        set_millis(
            &mut self.heartbeat_interval,
            parse_u64(lookup("HEARTBEAT_INTERVAL_MS")),
        );
        set_millis(
            &mut self.heartbeat_timeout,
            parse_u64(lookup("HEARTBEAT_TIMEOUT_MS")),
        );
        set_millis(
            &mut self.connect_timeout,
            parse_u64(lookup("CONNECT_TIMEOUT_MS")),
        );
        if let Some(v) = lookup("CONNECT_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            self.connect_attempts = v;
        }
        set_millis(
            &mut self.reconnect_backoff,
            parse_u64(lookup("RECONNECT_BACKOFF_MS")),
        );
        set_millis(
            &mut self.reconnect_backoff_max,
            parse_u64(lookup("RECONNECT_BACKOFF_MAX_MS")),
        );
        set_millis(&mut self.poll_interval, parse_u64(lookup("POLL_INTERVAL_MS")));
        set_millis(
            &mut self.request_timeout,
            parse_u64(lookup("REQUEST_TIMEOUT_MS")),
        );
        set_millis(
            &mut self.command_timeout,
            parse_u64(lookup("COMMAND_TIMEOUT_MS")),
        );
        set_millis(&mut self.startup_grace, parse_u64(lookup("STARTUP_GRACE_MS")));
    }
}

fn set_millis(target: &mut Duration, millis: Option<u64>) {
    if let Some(millis) = millis {
        *target = Duration::from_millis(millis);
    }
}

fn parse_u64(raw: Option<String>) -> Option<u64> {
    raw.and_then(|v| v.trim().parse().ok())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
