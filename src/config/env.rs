//! Engine environment
//!
//! Flat `key = value` tuning knobs (`xray.location.cert`, `xray.ray.buffer.size`, ...)
//! recorded into a typed structure. Unknown keys are kept verbatim so that
//! newer keys pass through untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::{debug, warn};

lazy_static! {
    /// Process-wide engine environment
    pub static ref ENGINE_ENV: RwLock<EngineEnv> = RwLock::new(EngineEnv::default());
}

/// Typed view of the recognized environment keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineEnv {
    pub asset_location: Option<PathBuf>,
    pub tool_location: Option<PathBuf>,
    pub cert_location: Option<PathBuf>,
    pub config_location: Option<PathBuf>,
    pub confdir_location: Option<PathBuf>,
    pub plugin_location: Option<PathBuf>,
    pub buf_readv: Option<bool>,
    pub buf_splice: Option<bool>,
    pub vmess_padding: Option<bool>,
    pub cone_disabled: Option<bool>,
    /// Per-connection relay buffer, in KiB
    pub ray_buffer_size: Option<usize>,
    pub browser_dialer: Option<String>,
    pub xudp_show: Option<bool>,
    pub xudp_basekey: Option<String>,
    raw: HashMap<String, String>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "off" | "disable" | "disabled" | "" => Some(false),
        _ => None,
    }
}

impl EngineEnv {
    /// Record a key. Values that fail to parse for a typed key are kept raw only.
    pub fn set(&mut self, key: &str, value: &str) {
        let path = || Some(PathBuf::from(value));
        let flag = || {
            let parsed = parse_bool(value);
            if parsed.is_none() {
                warn!("Ignoring non-boolean value '{}' for {}", value, key);
            }
            parsed
        };

        match key {
            "xray.location.asset" => self.asset_location = path(),
            "xray.location.tool" => self.tool_location = path(),
            "xray.location.cert" => self.cert_location = path(),
            "xray.location.config" => self.config_location = path(),
            "xray.location.confdir" => self.confdir_location = path(),
            "xray.location.plugin" => self.plugin_location = path(),
            "xray.buf.readv" => self.buf_readv = flag(),
            "xray.buf.splice" => self.buf_splice = flag(),
            "xray.vmess.padding" => self.vmess_padding = flag(),
            "xray.cone.disabled" => self.cone_disabled = flag(),
            "xray.ray.buffer.size" => {
                self.ray_buffer_size = match value.trim().parse::<usize>() {
                    Ok(size) => Some(size),
                    Err(_) => {
                        warn!("Ignoring invalid buffer size '{}'", value);
                        None
                    }
                }
            }
            "xray.browser.dialer" => self.browser_dialer = Some(value.to_string()),
            "xray.xudp.show" => self.xudp_show = flag(),
            "xray.xudp.basekey" => self.xudp_basekey = Some(value.to_string()),
            _ => debug!("Passing through unrecognized environment key {}", key),
        }

        self.raw.insert(key.to_string(), value.to_string());
    }

    /// Raw value of any key that was set
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    /// Resolve a certificate path against the cert location when relative
    pub fn resolve_cert(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        match &self.cert_location {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Relay buffer size in bytes, if configured and non-zero
    pub fn relay_buffer_bytes(&self) -> Option<usize> {
        self.ray_buffer_size
            .filter(|kib| *kib > 0)
            .map(|kib| kib.saturating_mul(1024))
    }
}

/// Set a key in the process-wide environment
pub fn set_env(key: &str, value: &str) {
    ENGINE_ENV.write().set(key, value);
}

/// Copy of the process-wide environment
pub fn snapshot() -> EngineEnv {
    ENGINE_ENV.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_keys() {
        let mut env = EngineEnv::default();
        env.set("xray.location.cert", "/etc/certs");
        env.set("xray.buf.splice", "enable");
        env.set("xray.ray.buffer.size", "64");
        env.set("xray.custom.knob", "42");

        assert_eq!(env.cert_location, Some(PathBuf::from("/etc/certs")));
        assert_eq!(env.buf_splice, Some(true));
        assert_eq!(env.relay_buffer_bytes(), Some(64 * 1024));
        assert_eq!(env.get("xray.custom.knob"), Some("42"));
    }

    #[test]
    fn test_invalid_values_stay_raw() {
        let mut env = EngineEnv::default();
        env.set("xray.ray.buffer.size", "lots");
        env.set("xray.cone.disabled", "maybe");

        assert_eq!(env.ray_buffer_size, None);
        assert_eq!(env.cone_disabled, None);
        assert_eq!(env.get("xray.ray.buffer.size"), Some("lots"));
    }

    #[test]
    fn test_resolve_cert() {
        let mut env = EngineEnv::default();
        assert_eq!(env.resolve_cert("ca.pem"), PathBuf::from("ca.pem"));

        env.set("xray.location.cert", "/etc/certs");
        assert_eq!(env.resolve_cert("ca.pem"), PathBuf::from("/etc/certs/ca.pem"));
        assert_eq!(env.resolve_cert("/abs/ca.pem"), PathBuf::from("/abs/ca.pem"));
    }
}
