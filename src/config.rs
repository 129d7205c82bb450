//! Process-wide configuration for the messaging layer.
//!
//! Services rendezvous through socket files in a single directory, resolved
//! in order: programmatic override, the `EVENTLINE_SERVICE_DIR` environment
//! variable, then `/tmp/eventline-services`. An optional bindings table
//! restricts which services a client may reach: once at least one binding
//! exists, [`Session::connect`](crate::Session::connect) resolves only
//! through it and unbound names fail with
//! [`Error::NotPermitted`](crate::Error::NotPermitted).

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

/// Largest request/response payload a session carries unless overridden at
/// connect/advertise time.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024;

#[derive(Default)]
struct ConfigState {
    service_dir: Option<PathBuf>,
    bindings: FxHashMap<String, String>,
    default_call_timeout: Option<Duration>,
}

fn state() -> &'static Mutex<ConfigState> {
    static STATE: OnceLock<Mutex<ConfigState>> = OnceLock::new();
    STATE.get_or_init(Default::default)
}

/// Overrides the directory service sockets live in.
pub fn set_service_dir(dir: impl Into<PathBuf>) {
    state().lock().service_dir = Some(dir.into());
}

/// The directory service sockets live in.
pub fn service_dir() -> PathBuf {
    if let Some(dir) = state().lock().service_dir.clone() {
        return dir;
    }
    if let Some(dir) = std::env::var_os("EVENTLINE_SERVICE_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/tmp/eventline-services")
}

/// Binds `alias` to `service`: clients connecting to `alias` reach
/// `service`. The first binding switches connection resolution to
/// allowlist mode.
pub fn bind(alias: impl Into<String>, service: impl Into<String>) {
    state().lock().bindings.insert(alias.into(), service.into());
}

/// Drops every binding, returning to open resolution.
pub fn clear_bindings() {
    state().lock().bindings.clear();
}

/// Default deadline for synchronous calls made with `timeout: None`.
/// `None` (the initial value) means such calls wait indefinitely.
pub fn set_default_call_timeout(timeout: Option<Duration>) {
    state().lock().default_call_timeout = timeout;
}

pub(crate) fn default_call_timeout() -> Option<Duration> {
    state().lock().default_call_timeout
}

/// Resolves a service name to its bound target and socket path.
pub(crate) fn resolve(name: &str) -> Result<(String, PathBuf)> {
    validate_name(name);

    let target = {
        let state = state().lock();
        if state.bindings.is_empty() {
            name.to_string()
        } else {
            match state.bindings.get(name) {
                Some(target) => target.clone(),
                None => return Err(Error::NotPermitted),
            }
        }
    };

    let dir = service_dir();
    if !dir.is_dir() {
        return Err(Error::Comm(io::Error::new(
            io::ErrorKind::NotFound,
            format!("service directory {} is unreachable", dir.display()),
        )));
    }
    let path = dir.join(format!("{target}.sock"));
    Ok((target, path))
}

pub(crate) fn socket_path(name: &str) -> PathBuf {
    service_dir().join(format!("{name}.sock"))
}

/// Service names become file names; anything that cannot be one is caller
/// misuse.
pub(crate) fn validate_name(name: &str) {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.');
    if !ok {
        panic!("invalid service name {name:?}");
    }
}
