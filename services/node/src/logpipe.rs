//! Node log pipeline: a log identity plus a local append-only buffer.
//!
//! The identity lives in `vnet.log.conf` next to the state file. The private
//! id never leaves the node; the public id is its SHA-256 and is what a log
//! collector would index by.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub const LOG_CONFIG_FILE: &str = "vnet.log.conf";
pub const LOG_BUFFER_FILE: &str = "vnet.log.buf";

const COLLECTION: &str = "vnet-node.log";

/// Persisted log identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPolicy {
    pub collection: String,
    pub private_id: String,
    pub public_id: String,
}

impl LogPolicy {
    pub fn generate() -> Self {
        let private: [u8; 32] = rand::random();
        Self {
            collection: COLLECTION.to_string(),
            private_id: hex::encode(private),
            public_id: hex::encode(Sha256::digest(private)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.collection != COLLECTION {
            bail!("log policy is for collection {:?}", self.collection);
        }
        let private = hex::decode(&self.private_id).context("private log id is not hex")?;
        if hex::encode(Sha256::digest(&private)) != self.public_id {
            bail!("public log id does not match private id");
        }
        Ok(())
    }

    /// Read the policy at `path`, replacing it if missing or invalid.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if let Ok(content) = fs::read_to_string(path) {
            match serde_json::from_str::<LogPolicy>(&content) {
                Ok(policy) if policy.validate().is_ok() => return Ok(policy),
                Ok(_) | Err(_) => {
                    warn!(path = %path.display(), "invalid log policy, generating a new one");
                }
            }
        }

        let policy = Self::generate();
        let tmp_path = path.with_extension("tmp");
        let content =
            serde_json::to_string_pretty(&policy).context("Failed to serialize log policy")?;
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename {} -> {}", tmp_path.display(), path.display()))?;
        Ok(policy)
    }
}

/// Open log pipeline owned by a running server.
pub struct LogPipeline {
    policy: LogPolicy,
    buffer_path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl LogPipeline {
    pub fn open(dir: &Path) -> Result<Self> {
        let policy = LogPolicy::load_or_create(&dir.join(LOG_CONFIG_FILE))?;

        let buffer_path = dir.join(LOG_BUFFER_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)
            .with_context(|| format!("Failed to open log buffer: {}", buffer_path.display()))?;

        info!(public_id = %policy.public_id, "log pipeline started");
        Ok(Self {
            policy,
            buffer_path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn public_id(&self) -> &str {
        &self.policy.public_id
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    fn writer(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one line. Lines after shutdown are discarded.
    pub fn record(&self, message: &str) {
        let mut writer = self.writer();
        if let Some(w) = writer.as_mut() {
            let line = format!("{} {}\n", chrono::Utc::now().to_rfc3339(), message);
            if let Err(e) = w.write_all(line.as_bytes()) {
                warn!(error = %e, "log buffer write failed");
            }
        }
    }

    /// Flush and close the buffer. Failures are logged, not returned.
    pub async fn shutdown(&self) {
        let taken = self.writer().take();
        let Some(mut writer) = taken else {
            return;
        };
        match tokio::task::spawn_blocking(move || writer.flush()).await {
            Ok(Ok(())) => debug!(path = %self.buffer_path.display(), "log buffer flushed"),
            Ok(Err(e)) => warn!(error = %e, "log buffer flush failed"),
            Err(e) => warn!(error = %e, "log buffer flush task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_policy_is_stable_across_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOG_CONFIG_FILE);

        let first = LogPolicy::load_or_create(&path).unwrap();
        let second = LogPolicy::load_or_create(&path).unwrap();
        assert_eq!(first, second);
        assert!(first.validate().is_ok());
    }

    #[test]
    fn test_tampered_policy_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOG_CONFIG_FILE);

        let mut policy = LogPolicy::generate();
        policy.public_id = "00".repeat(32);
        assert!(policy.validate().is_err());
        fs::write(&path, serde_json::to_string(&policy).unwrap()).unwrap();

        let replaced = LogPolicy::load_or_create(&path).unwrap();
        assert_ne!(replaced.private_id, policy.private_id);
        assert!(replaced.validate().is_ok());
    }

    #[tokio::test]
    async fn test_records_flushed_on_shutdown() {
        let dir = tempdir().unwrap();
        let pipeline = LogPipeline::open(dir.path()).unwrap();
        pipeline.record("server started");
        pipeline.shutdown().await;
        pipeline.record("after shutdown");
        pipeline.shutdown().await;

        let content = fs::read_to_string(pipeline.buffer_path()).unwrap();
        assert!(content.contains("server started"));
        assert!(!content.contains("after shutdown"));
        assert_eq!(pipeline.public_id().len(), 64);
    }
}
