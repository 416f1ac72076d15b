//! Mirror configuration
//!
//! All settings are resolved once into an immutable [`MirrorConfig`].
//! Explicit builder values win; anything left unset falls back to the
//! `S3MIRROR_*` environment variables.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_ENDPOINT: &str = "S3MIRROR_ENDPOINT";
pub const ENV_ACCESS_KEY: &str = "S3MIRROR_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "S3MIRROR_SECRET_KEY";
pub const ENV_CACHE_DIR: &str = "S3MIRROR_CACHE_DIR";
pub const ENV_CLIENT_NAME: &str = "S3MIRROR_CLIENT_NAME";
pub const ENV_SECURE: &str = "S3MIRROR_SECURE";
pub const ENV_REGION: &str = "S3MIRROR_REGION";
pub const ENV_DISABLE_AUTO_REFRESH: &str = "S3MIRROR_DISABLE_AUTO_REFRESH";
pub const ENV_WORKERS: &str = "S3MIRROR_WORKERS";

/// Default endpoint (a local MinIO)
const DEFAULT_ENDPOINT: &str = "127.0.0.1:9000";

const DEFAULT_REGION: &str = "us-east-1";

/// Resolved, immutable configuration.
///
/// Serializable so batch workers can be handed a snapshot instead of a live
/// client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// `host[:port]` or a full `http(s)://` URL
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    /// Root of the local mirror and home of the metadata file
    pub cache_root: PathBuf,
    /// Sent as the HTTP user agent when set
    pub client_name: Option<String>,
    /// Use TLS when the endpoint carries no scheme
    pub secure: bool,
    pub region: String,
    /// Run without a metadata store; `Refresh::Auto` is rejected
    pub disable_auto_refresh: bool,
    /// Batch worker pool size
    pub workers: usize,
}

impl MirrorConfig {
    /// Start building a configuration
    pub fn builder() -> MirrorConfigBuilder {
        MirrorConfigBuilder::default()
    }

    /// Resolve everything from the environment
    pub fn from_env() -> Result<Self> {
        Self::builder().build()
    }
}

impl fmt::Debug for MirrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("cache_root", &self.cache_root)
            .field("client_name", &self.client_name)
            .field("secure", &self.secure)
            .field("region", &self.region)
            .field("disable_auto_refresh", &self.disable_auto_refresh)
            .field("workers", &self.workers)
            .finish()
    }
}

/// Builder for [`MirrorConfig`]; unset fields fall back to the environment
#[derive(Debug, Default, Clone)]
pub struct MirrorConfigBuilder {
    endpoint: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    cache_root: Option<PathBuf>,
    client_name: Option<String>,
    secure: Option<bool>,
    region: Option<String>,
    disable_auto_refresh: Option<bool>,
    workers: Option<usize>,
}

impl MirrorConfigBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = Some(key.into());
        self
    }

    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Disable the metadata store for the lifetime of the engine
    pub fn disable_auto_refresh(mut self, disabled: bool) -> Self {
        self.disable_auto_refresh = Some(disabled);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Resolve using the process environment
    pub fn build(self) -> Result<MirrorConfig> {
        self.build_with(|name| std::env::var(name).ok())
    }

    /// Resolve using an arbitrary variable lookup
    pub fn build_with<F>(self, lookup: F) -> Result<MirrorConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let cache_root = self
            .cache_root
            .or_else(|| var(ENV_CACHE_DIR).map(PathBuf::from))
            .or_else(|| dirs::cache_dir().map(|d| d.join("s3mirror")))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no cache root: pass one explicitly or set {}",
                    ENV_CACHE_DIR
                ))
            })?;

        let secure = match self.secure {
            Some(secure) => secure,
            None => parse_flag(ENV_SECURE, var(ENV_SECURE))?,
        };
        let disable_auto_refresh = match self.disable_auto_refresh {
            Some(disabled) => disabled,
            None => parse_flag(ENV_DISABLE_AUTO_REFRESH, var(ENV_DISABLE_AUTO_REFRESH))?,
        };

        let workers = match self.workers {
            Some(n) => n,
            None => match var(ENV_WORKERS) {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    Error::Configuration(format!("{} must be a positive integer", ENV_WORKERS))
                })?,
                None => std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1),
            },
        };
        if workers == 0 {
            return Err(Error::Configuration(
                "worker pool size must be at least 1".to_string(),
            ));
        }

        Ok(MirrorConfig {
            endpoint: self
                .endpoint
                .or_else(|| var(ENV_ENDPOINT))
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            access_key: self
                .access_key
                .or_else(|| var(ENV_ACCESS_KEY))
                .unwrap_or_default(),
            secret_key: self
                .secret_key
                .or_else(|| var(ENV_SECRET_KEY))
                .unwrap_or_default(),
            cache_root,
            client_name: self.client_name.or_else(|| var(ENV_CLIENT_NAME)),
            secure,
            region: self
                .region
                .or_else(|| var(ENV_REGION))
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            disable_auto_refresh,
            workers,
        })
    }
}

fn parse_flag(name: &str, raw: Option<String>) -> Result<bool> {
    let Some(raw) = raw else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Configuration(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_environment_fallback() {
        let config = MirrorConfig::builder()
            .build_with(env(&[
                (ENV_ENDPOINT, "minio.local:9000"),
                (ENV_ACCESS_KEY, "ak"),
                (ENV_SECRET_KEY, "sk"),
                (ENV_CACHE_DIR, "/var/cache/mirror"),
                (ENV_SECURE, "true"),
                (ENV_WORKERS, "3"),
            ]))
            .unwrap();

        assert_eq!(config.endpoint, "minio.local:9000");
        assert_eq!(config.access_key, "ak");
        assert_eq!(config.secret_key, "sk");
        assert_eq!(config.cache_root, PathBuf::from("/var/cache/mirror"));
        assert!(config.secure);
        assert!(!config.disable_auto_refresh);
        assert_eq!(config.workers, 3);
        assert_eq!(config.region, "us-east-1");
    }

    #[test]
    fn test_explicit_values_override_environment() {
        let config = MirrorConfig::builder()
            .endpoint("explicit:9000")
            .cache_root("/tmp/explicit")
            .secure(false)
            .disable_auto_refresh(true)
            .build_with(env(&[
                (ENV_ENDPOINT, "env:9000"),
                (ENV_CACHE_DIR, "/tmp/env"),
                (ENV_SECURE, "1"),
            ]))
            .unwrap();

        assert_eq!(config.endpoint, "explicit:9000");
        assert_eq!(config.cache_root, PathBuf::from("/tmp/explicit"));
        assert!(!config.secure);
        assert!(config.disable_auto_refresh);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_flag = MirrorConfig::builder()
            .cache_root("/tmp/x")
            .build_with(env(&[(ENV_SECURE, "maybe")]));
        assert!(matches!(bad_flag, Err(Error::Configuration(_))));

        let zero_workers = MirrorConfig::builder()
            .cache_root("/tmp/x")
            .workers(0)
            .build_with(env(&[]));
        assert!(matches!(zero_workers, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = MirrorConfig::builder()
            .cache_root("/tmp/x")
            .secret_key("super-secret")
            .build_with(env(&[]))
            .unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let config = MirrorConfig::builder()
            .cache_root("/tmp/x")
            .workers(2)
            .build_with(env(&[]))
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: MirrorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
