//! Gateway login token cache
//!
//! The cache file is shared by every hook process on the host. Readers never
//! trust it: an unreadable or malformed file simply means "log in again".

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{HookError, Result};

/// Tokens expiring within this many seconds are treated as expired
pub const EXPIRY_MARGIN_SECS: i64 = 30;

/// File name of the cache under `base_data_path`
pub const CACHE_FILE: &str = "zm_login.json";

/// Contents of the cache file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub token: String,
    /// Lifetime in seconds, as returned by the gateway
    pub expires: i64,
    /// Unix time the token was obtained
    pub time: i64,
}

impl CachedToken {
    pub fn is_valid(&self, now: i64) -> bool {
        now + EXPIRY_MARGIN_SECS - self.time < self.expires
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cache at `{base_data_path}/zm_login.json`
    pub fn in_dir(base_data_path: &Path) -> Self {
        Self::new(base_data_path.join(CACHE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cache; any problem yields `None`
    pub fn load(&self) -> Option<CachedToken> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(token) => Some(token),
            Err(e) => {
                log::debug!("Ignoring unreadable token cache {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// A cached token that is still good at `now`
    pub fn valid_token(&self, now: i64) -> Option<String> {
        let cached = self.load()?;
        if cached.is_valid(now) {
            log::debug!("Using cached gateway token");
            Some(cached.token)
        } else {
            log::debug!("Cached gateway token expired");
            None
        }
    }

    pub fn store(&self, token: &str, expires: i64, now: i64) -> Result<()> {
        let cached = CachedToken {
            token: token.to_string(),
            expires,
            time: now,
        };
        let json = serde_json::to_string(&cached)
            .map_err(|e| HookError::OutputWrite(format!("token cache: {}", e)))?;
        std::fs::write(&self.path, json).map_err(|e| {
            HookError::OutputWrite(format!("token cache {}: {}", self.path.display(), e))
        })
    }
}
