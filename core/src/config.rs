//! Global config singleton. Loads an optional `h2.json` from the current directory once;
//! every caller after the first gets the same cached instance. Unlike settings that drive
//! external integrations, everything here is daemon-local: where sockets live, the idle
//! thresholds the tracker and delivery loop use, and the cached terminal color-query replies.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached config for the running daemon process.
pub struct Config {
    /// Directory that holds `<type>.<name>.sock` listener sockets (spec.md §6).
    pub sockets_dir: PathBuf,
    /// Directory short-path symlinks are created in when a socket path would exceed the
    /// platform limit (spec.md §6).
    pub short_socket_dir: PathBuf,
    /// Directory `send` request bodies are persisted under, per session (spec.md §6).
    pub messages_root: PathBuf,
    /// `vt.is_idle(threshold)` and the output-timing heuristic both use this (spec.md §4.1, §4.4).
    pub idle_threshold: Duration,
    /// Deadline passed to `write_pty` by the delivery loop (spec.md §4.3).
    pub pty_write_deadline: Duration,
    /// Cached OSC 10 (foreground) reply, xterm `rgb:` format.
    pub osc_fg: String,
    /// Cached OSC 11 (background) reply, xterm `rgb:` format.
    pub osc_bg: String,
}

/// Ensure config is loaded (idempotent). Loads `h2.json` on first call; returns the same
/// instance on every later call.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(load)
}

fn load() -> Config {
    let path = PathBuf::from("h2.json");
    let root = std::fs::read_to_string(&path)
        .ok()
        .and_then(|data| serde_json::from_str::<serde_json::Value>(&data).ok());

    let sockets_dir = root
        .as_ref()
        .and_then(|r| r.get("sockets_dir"))
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(default_sockets_dir);

    let messages_root = root
        .as_ref()
        .and_then(|r| r.get("messages_root"))
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| sockets_dir.join("messages"));

    let idle_threshold = root
        .as_ref()
        .and_then(|r| r.get("idle_threshold_ms"))
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_secs(2));

    let pty_write_deadline = root
        .as_ref()
        .and_then(|r| r.get("pty_write_deadline_ms"))
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_secs(2));

    let osc_fg = std::env::var("H2_FG").unwrap_or_else(|_| "rgb:ffff/ffff/ffff".to_string());
    let osc_bg = std::env::var("H2_BG").unwrap_or_else(|_| "rgb:0000/0000/0000".to_string());

    Config {
        sockets_dir,
        short_socket_dir: std::env::temp_dir().join("h2-sock"),
        messages_root,
        idle_threshold,
        pty_write_deadline,
        osc_fg,
        osc_bg,
    }
}

/// Default sockets directory: `$XDG_RUNTIME_DIR/h2` or `/tmp/h2-<uid>` as a fallback.
fn default_sockets_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("h2");
    }
    PathBuf::from(format!("/tmp/h2-{}", current_uid()))
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
