//! Bridge configuration.
//!
//! Everything comes from environment variables (a `.env` file is loaded by
//! `main` first). Unset variables fall back to defaults; malformed ones fail
//! startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;

use crate::provision::ProvisionPolicy;

const DEFAULT_BUNDLE_DIR: &str = "tessdata";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Read-only bundled language data (`TESSDATA_BUNDLE_DIR`).
    pub bundle_dir: PathBuf,
    /// Writable root under which `tessdata/` is staged (`TESSDATA_RUNTIME_ROOT`).
    /// `None` when no override is set and the platform has no data directory.
    pub runtime_root: Option<PathBuf>,
    pub provision_policy: ProvisionPolicy,
    pub tesseract_bin: PathBuf,
    pub recognition_timeout: Option<Duration>,
    pub bind_addr: SocketAddr,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let runtime_root = match var("TESSDATA_RUNTIME_ROOT") {
            Some(root) => Some(PathBuf::from(root)),
            None => default_runtime_root(),
        };

        let provision_policy = match var("TESSDATA_PROVISION_POLICY") {
            Some(raw) => ProvisionPolicy::from_str(raw.trim()).with_context(|| {
                format!("TESSDATA_PROVISION_POLICY must be 'always' or 'once', got '{}'", raw)
            })?,
            None => ProvisionPolicy::Always,
        };

        let recognition_timeout = match var("RECOGNITION_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("RECOGNITION_TIMEOUT_SECS is not a number: '{}'", raw))?;
                if secs == 0 {
                    bail!("RECOGNITION_TIMEOUT_SECS must be greater than zero");
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let bind_addr: SocketAddr = var("BRIDGE_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("BRIDGE_ADDR is not a valid socket address")?;

        Ok(Self {
            bundle_dir: var("TESSDATA_BUNDLE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUNDLE_DIR)),
            runtime_root,
            provision_policy,
            tesseract_bin: var("TESSERACT_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tesseract")),
            recognition_timeout,
            bind_addr,
        })
    }
}

/// Per-application private data directory.
fn default_runtime_root() -> Option<PathBuf> {
    ProjectDirs::from("", "", "tesseract-bridge").map(|dirs| dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<BridgeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bundle_dir, PathBuf::from("tessdata"));
        assert_eq!(config.provision_policy, ProvisionPolicy::Always);
        assert_eq!(config.tesseract_bin, PathBuf::from("tesseract"));
        assert_eq!(config.recognition_timeout, None);
        assert_eq!(config.bind_addr, "0.0.0.0:3000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TESSDATA_BUNDLE_DIR", "/opt/app/tessdata"),
            ("TESSDATA_RUNTIME_ROOT", "/var/lib/bridge"),
            ("TESSDATA_PROVISION_POLICY", "once"),
            ("TESSERACT_BIN", "/usr/local/bin/tesseract"),
            ("RECOGNITION_TIMEOUT_SECS", "30"),
            ("BRIDGE_ADDR", "127.0.0.1:8080"),
        ])
        .unwrap();

        assert_eq!(config.bundle_dir, PathBuf::from("/opt/app/tessdata"));
        assert_eq!(config.runtime_root, Some(PathBuf::from("/var/lib/bridge")));
        assert_eq!(config.provision_policy, ProvisionPolicy::Once);
        assert_eq!(config.tesseract_bin, PathBuf::from("/usr/local/bin/tesseract"));
        assert_eq!(config.recognition_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.bind_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("TESSDATA_PROVISION_POLICY", "never")]).is_err());
        assert!(load(&[("RECOGNITION_TIMEOUT_SECS", "soon")]).is_err());
        assert!(load(&[("RECOGNITION_TIMEOUT_SECS", "0")]).is_err());
        assert!(load(&[("BRIDGE_ADDR", "localhost")]).is_err());
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = load(&[("TESSDATA_BUNDLE_DIR", "  "), ("RECOGNITION_TIMEOUT_SECS", "")]).unwrap();
        assert_eq!(config.bundle_dir, PathBuf::from("tessdata"));
        assert_eq!(config.recognition_timeout, None);
    }
}
