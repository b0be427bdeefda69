use std::{env, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const POLL_INTERVAL_ENV: &str = "FORKSYNC_POLL_INTERVAL_MS";
pub const WRITE_TIMEOUT_ENV: &str = "FORKSYNC_WRITE_TIMEOUT_MS";
pub const READ_CHUNK_ENV: &str = "FORKSYNC_READ_CHUNK";

/// Tunables shared by the outcome channel and the sync channel.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// How long a single readiness wait in `wait` may block before the child
    /// is checked for an early exit.
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for a peer to accept written bytes.
    pub write_timeout_ms: u64,
    /// Size of each read from a channel half.
    pub read_chunk: usize,
    /// Cap applied when growing the child's socket send buffer.
    pub max_send_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval_ms: 1000,
            write_timeout_ms: 1000,
            read_chunk: 1024,
            max_send_buffer: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Defaults overlaid with any `FORKSYNC_*` variables present in the
    /// environment. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(ms) = env_var(POLL_INTERVAL_ENV) {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = env_var(WRITE_TIMEOUT_ENV) {
            config.write_timeout_ms = ms;
        }
        if let Some(chunk) = env_var(READ_CHUNK_ENV) {
            config.read_chunk = chunk;
        }
        config.normalized()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = fs::File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        serde_json::to_writer(&file, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let config: Config = serde_json::from_reader(&file)
            .with_context(|| format!("failed to parse config {:?}", path))?;
        Ok(config.normalized())
    }

    // A zero chunk would make every read look like end of stream.
    fn normalized(mut self) -> Self {
        if self.read_chunk == 0 {
            self.read_chunk = Config::default().read_chunk;
        }
        self
    }
}

fn env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_save_and_load() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("forksync.json");
        let config = Config {
            poll_interval_ms: 50,
            ..Default::default()
        };
        config.save(&path)?;
        assert_eq!(Config::load(&path)?, config);
        Ok(())
    }

    #[test]
    fn test_config_load_partial_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("partial.json");
        fs::write(&path, r#"{"writeTimeoutMs": 5, "readChunk": 0}"#)?;
        let config = Config::load(&path)?;
        assert_eq!(config.write_timeout(), Duration::from_millis(5));
        assert_eq!(config.read_chunk, 1024);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        env::set_var(POLL_INTERVAL_ENV, "25");
        env::set_var(READ_CHUNK_ENV, "not a number");
        let config = Config::from_env();
        env::remove_var(POLL_INTERVAL_ENV);
        env::remove_var(READ_CHUNK_ENV);

        assert_eq!(config.poll_interval(), Duration::from_millis(25));
        assert_eq!(config.read_chunk, 1024);
    }
}
