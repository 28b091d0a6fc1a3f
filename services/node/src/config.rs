//! Server configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Error;
use crate::store::StateStore;

/// Name of the state file inside the state directory.
pub const STATE_FILE: &str = "vnet.state";

/// Environment variables read by [`ServerConfig::from_env`] and at start.
pub const ENV_DIR: &str = "VNET_DIR";
pub const ENV_HOSTNAME: &str = "VNET_HOSTNAME";
pub const ENV_AUTHKEY: &str = "VNET_AUTHKEY";
pub const ENV_AUTH_KEY: &str = "VNET_AUTH_KEY";
pub const ENV_CONTROL_URL: &str = "VNET_CONTROL_URL";
pub const ENV_EPHEMERAL: &str = "VNET_EPHEMERAL";
pub const ENV_PORT: &str = "VNET_PORT";
pub const ENV_RUN_WEB_CLIENT: &str = "VNET_RUN_WEB_CLIENT";
pub const ENV_LOG_PIPELINE: &str = "VNET_LOG_PIPELINE";
pub const ENV_FORCE_LOGIN: &str = "VNET_FORCE_LOGIN";

/// Node configuration. Fixed once the server is constructed.
#[derive(Clone)]
pub struct ServerConfig {
    /// State directory. Defaults to `<user config dir>/vnet-<program>`.
    pub dir: Option<PathBuf>,

    /// Hostname to register. Defaults to the program name.
    pub hostname: Option<String>,

    /// Pre-authorized key used if the node needs to log in.
    pub auth_key: Option<String>,

    /// Control-plane URL. `None` uses the backend's default.
    pub control_url: Option<String>,

    /// Remove the node from the network when it goes offline.
    pub ephemeral: bool,

    /// UDP port for the packet engine. 0 picks one.
    pub port: u16,

    /// Serve the node's web client on the overlay.
    pub run_web_client: bool,

    /// State store. Defaults to a file in the state directory.
    pub store: Option<Arc<dyn StateStore>>,

    /// Keep a local log buffer in the state directory.
    pub log_pipeline: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dir: None,
            hostname: None,
            auth_key: None,
            control_url: None,
            ephemeral: false,
            port: 0,
            run_web_client: false,
            store: None,
            log_pipeline: true,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("dir", &self.dir)
            .field("hostname", &self.hostname)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("control_url", &self.control_url)
            .field("ephemeral", &self.ephemeral)
            .field("port", &self.port)
            .field("run_web_client", &self.run_web_client)
            .field("store", &self.store.as_ref().map(|s| s.is_in_memory()))
            .field("log_pipeline", &self.log_pipeline)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let dir = env_nonempty(ENV_DIR).map(PathBuf::from);
        let hostname = env_nonempty(ENV_HOSTNAME);
        let auth_key = env_auth_key();
        let control_url = env_nonempty(ENV_CONTROL_URL);

        let ephemeral = env_bool(ENV_EPHEMERAL).unwrap_or(false);
        let run_web_client = env_bool(ENV_RUN_WEB_CLIENT).unwrap_or(false);
        let log_pipeline = env_bool(ENV_LOG_PIPELINE).unwrap_or(true);

        let port = match env_nonempty(ENV_PORT) {
            Some(p) => p
                .parse()
                .map_err(|_| anyhow::anyhow!("{ENV_PORT} must be a port number, got {p:?}"))?,
            None => 0,
        };

        Ok(Self {
            dir,
            hostname,
            auth_key,
            control_url,
            ephemeral,
            port,
            run_web_client,
            store: None,
            log_pipeline,
        })
    }

    /// The auth key to present: the configured one, else the environment's.
    pub fn resolved_auth_key(&self) -> Option<String> {
        self.auth_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(env_auth_key)
    }

    pub fn resolved_hostname(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(program_name)
    }

    /// The state directory to use, without touching the filesystem.
    pub fn resolved_dir(&self) -> Result<PathBuf, Error> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        let base = directories::BaseDirs::new().ok_or(Error::NoStateDir)?;
        Ok(base.config_dir().join(format!("vnet-{}", program_name())))
    }

    /// Reject combinations that can never start.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(store) = &self.store {
            if store.is_in_memory() && !self.ephemeral {
                return Err(Error::MemStoreRequiresEphemeral);
            }
        }
        Ok(())
    }
}

/// Lower-cased executable name without extension.
pub fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::file_stem)
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "vnet".to_string())
}

/// Create the state directory (mode 0700) and check it is a directory.
pub fn ensure_state_dir(dir: &Path) -> Result<(), Error> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;

    if !std::fs::metadata(dir)?.is_dir() {
        return Err(Error::NotADirectory(dir.to_path_buf()));
    }
    Ok(())
}

pub(crate) fn force_login() -> bool {
    env_bool(ENV_FORCE_LOGIN).unwrap_or(false)
}

fn env_auth_key() -> Option<String> {
    env_nonempty(ENV_AUTHKEY).or_else(|| env_nonempty(ENV_AUTH_KEY))
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_nonempty(name).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use tempfile::tempdir;

    #[test]
    fn test_mem_store_requires_ephemeral() {
        let mut config = ServerConfig {
            store: Some(Arc::new(MemStore::new())),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::MemStoreRequiresEphemeral)
        ));

        config.ephemeral = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_values_win() {
        let config = ServerConfig {
            dir: Some(PathBuf::from("/tmp/vnet-test")),
            hostname: Some("web-1".into()),
            auth_key: Some("key-abc".into()),
            ..Default::default()
        };
        assert_eq!(config.resolved_dir().unwrap(), PathBuf::from("/tmp/vnet-test"));
        assert_eq!(config.resolved_hostname(), "web-1");
        assert_eq!(config.resolved_auth_key().as_deref(), Some("key-abc"));
    }

    #[test]
    fn test_hostname_defaults_to_program() {
        let config = ServerConfig::default();
        let hostname = config.resolved_hostname();
        assert!(!hostname.is_empty());
        assert_eq!(hostname, hostname.to_lowercase());
    }

    #[test]
    fn test_debug_redacts_auth_key() {
        let config = ServerConfig {
            auth_key: Some("secret-key".into()),
            ..Default::default()
        };
        let shown = format!("{config:?}");
        assert!(!shown.contains("secret-key"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn test_ensure_state_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b");
        ensure_state_dir(&nested).unwrap();
        assert!(nested.is_dir());

        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(ensure_state_dir(&file).is_err());
    }
}
