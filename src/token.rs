//! The long-lived access token shared by the browser UI and the gateway.

use rand::RngCore;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

const TOKEN_FILE: &str = "gateway.token";

/// Secret used both to authorize the browser UI and to authenticate the
/// wrapper to the gateway. Never mutated once loaded.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact match against a presented token
    pub fn matches(&self, presented: &str) -> bool {
        // Length is not secret; compare bytes without early exit
        let (a, b) = (self.0.as_bytes(), presented.as_bytes());
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    /// Resolve the deployment's token.
    ///
    /// A configured token wins (and is persisted if nothing is stored yet),
    /// then the token persisted under `state_dir`, then a freshly generated
    /// one which is written back for subsequent runs.
    pub fn load_or_create(state_dir: &Path, configured: Option<&str>) -> anyhow::Result<Self> {
        let path = token_path(state_dir);

        if let Some(token) = configured.map(str::trim).filter(|t| !t.is_empty()) {
            if !path.exists() {
                persist(&path, token)?;
            }
            return Ok(Self::new(token));
        }

        if path.exists() {
            let stored = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read token file {}: {}", path.display(), e))?;
            let stored = stored.trim();
            if !stored.is_empty() {
                return Ok(Self::new(stored));
            }
        }

        let token = generate();
        persist(&path, &token)?;
        info!(path = %path.display(), "Generated new gateway access token");
        Ok(Self::new(token))
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

fn token_path(state_dir: &Path) -> PathBuf {
    state_dir.join(TOKEN_FILE)
}

fn generate() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn persist(path: &Path, token: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!("Failed to create state directory {}: {}", parent.display(), e)
        })?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    use std::io::Write;
    let mut file = options
        .open(path)
        .map_err(|e| anyhow::anyhow!("Failed to write token file {}: {}", path.display(), e))?;
    writeln!(file, "{}", token)?;
    Ok(())
}
