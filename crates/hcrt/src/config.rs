// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration.
//!
//! Compile-time defaults, the [`RuntimeConfig`] handed to
//! [`RuntimeBuilder`](crate::RuntimeBuilder), and its two overlays:
//! environment variables (`HCRT_*`) and, with the `config-loaders` feature,
//! a YAML file.
//!
//! ```yaml
//! credits_per_ep_ctx: 64
//! rpc_timeout_secs: 30
//! max_contexts: 8
//! primary_group_id: storage_ranks
//! ```

use std::time::Duration;

use crate::error::{Error, Result};
use crate::group::validate_group_id;

/// Default number of outstanding RPCs per (context, destination rank).
pub const DEFAULT_CREDITS_PER_EP_CTX: u32 = 32;

/// Upper bound for the per-endpoint credit. Larger values are clamped.
pub const MAX_CREDITS_PER_EP_CTX: u32 = 256;

/// Default per-RPC deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum length of a group identifier, in bytes.
pub const GROUP_ID_MAX_LEN: usize = 64;

/// Default number of contexts a runtime may hold at once.
pub const DEFAULT_MAX_CONTEXTS: usize = 64;

/// Identifier of the group spanning every rank of the job.
pub const DEFAULT_PRIMARY_GROUP_ID: &str = "hcrt_default_group";

/// Longest single transport poll within a bounded progress wait.
pub const MAX_PROGRESS_SLICE: Duration = Duration::from_secs(1);

/// Poll slice used when progress waits without a deadline.
pub const INFINITE_PROGRESS_SLICE: Duration = Duration::from_millis(1);

/// Environment variable overriding [`RuntimeConfig::credits_per_ep_ctx`].
pub const ENV_CREDITS: &str = "HCRT_CREDIT_EP_CTX";
/// Environment variable overriding [`RuntimeConfig::rpc_timeout`] (seconds).
pub const ENV_TIMEOUT: &str = "HCRT_TIMEOUT";
/// Environment variable overriding [`RuntimeConfig::max_contexts`].
pub const ENV_MAX_CONTEXTS: &str = "HCRT_MAX_CONTEXTS";
/// Environment variable overriding [`RuntimeConfig::primary_group_id`].
pub const ENV_PRIMARY_GROUP: &str = "HCRT_PRIMARY_GROUP";

/// Parameters of one runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Outstanding RPCs allowed per endpoint. `0` disables flow control.
    pub credits_per_ep_ctx: u32,

    /// Deadline applied to every dispatched RPC.
    pub rpc_timeout: Duration,

    /// Maximum number of live contexts.
    pub max_contexts: usize,

    /// Identifier of the primary group.
    pub primary_group_id: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            credits_per_ep_ctx: DEFAULT_CREDITS_PER_EP_CTX,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            max_contexts: DEFAULT_MAX_CONTEXTS,
            primary_group_id: DEFAULT_PRIMARY_GROUP_ID.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Set the per-endpoint credit (clamped to [`MAX_CREDITS_PER_EP_CTX`]).
    pub fn with_credits(mut self, credits: u32) -> Self {
        self.credits_per_ep_ctx = clamp_credits(credits);
        self
    }

    /// Set the per-RPC deadline.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the context limit.
    pub fn with_max_contexts(mut self, max: usize) -> Self {
        self.max_contexts = max;
        self
    }

    /// Set the primary group identifier.
    pub fn with_primary_group_id(mut self, id: impl Into<String>) -> Self {
        self.primary_group_id = id.into();
        self
    }

    /// Defaults overlaid with the `HCRT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay values produced by `lookup` (keyed by environment variable name).
    ///
    /// Malformed values are logged and ignored.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_CREDITS) {
            match raw.trim().parse::<u32>() {
                Ok(v) => self.credits_per_ep_ctx = clamp_credits(v),
                Err(_) => log::warn!("[config] ignoring {}={:?}: not a number", ENV_CREDITS, raw),
            }
        }
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            match raw.trim().parse::<u64>() {
                Ok(0) => log::warn!("[config] ignoring {}=0: timeout must be positive", ENV_TIMEOUT),
                Ok(secs) => self.rpc_timeout = Duration::from_secs(secs),
                Err(_) => log::warn!("[config] ignoring {}={:?}: not a number", ENV_TIMEOUT, raw),
            }
        }
        if let Some(raw) = lookup(ENV_MAX_CONTEXTS) {
            match raw.trim().parse::<usize>() {
                Ok(v) if v > 0 => self.max_contexts = v,
                _ => log::warn!("[config] ignoring {}={:?}", ENV_MAX_CONTEXTS, raw),
            }
        }
        if let Some(raw) = lookup(ENV_PRIMARY_GROUP) {
            match validate_group_id(&raw) {
                Ok(()) => self.primary_group_id = raw,
                Err(e) => log::warn!("[config] ignoring {}: {}", ENV_PRIMARY_GROUP, e),
            }
        }
        self
    }

    /// Check the configuration before a runtime is built from it.
    ///
    /// Oversized credits are not an error; the builder clamps them.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_timeout.is_zero() {
            return Err(Error::InvalidArgument("rpc_timeout must be positive".into()));
        }
        if self.max_contexts == 0 {
            return Err(Error::InvalidArgument("max_contexts must be positive".into()));
        }
        validate_group_id(&self.primary_group_id)
    }
}

/// Clamp a requested credit to [`MAX_CREDITS_PER_EP_CTX`].
pub fn clamp_credits(credits: u32) -> u32 {
    if credits > MAX_CREDITS_PER_EP_CTX {
        log::warn!(
            "[config] credits_per_ep_ctx {} exceeds max {}, using {}",
            credits,
            MAX_CREDITS_PER_EP_CTX,
            MAX_CREDITS_PER_EP_CTX
        );
        MAX_CREDITS_PER_EP_CTX
    } else {
        credits
    }
}

#[cfg(feature = "config-loaders")]
mod yaml {
    use std::path::Path;
    use std::time::Duration;

    use serde::Deserialize;

    use super::{clamp_credits, RuntimeConfig};
    use crate::error::{Error, Result};

    #[derive(Debug, Default, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ConfigFile {
        credits_per_ep_ctx: Option<u32>,
        rpc_timeout_secs: Option<u64>,
        max_contexts: Option<usize>,
        primary_group_id: Option<String>,
    }

    impl RuntimeConfig {
        /// Parse a YAML document. Missing keys keep their defaults.
        pub fn from_yaml_str(text: &str) -> Result<Self> {
            let file: ConfigFile =
                serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
            let mut cfg = RuntimeConfig::default();
            if let Some(credits) = file.credits_per_ep_ctx {
                cfg.credits_per_ep_ctx = clamp_credits(credits);
            }
            if let Some(secs) = file.rpc_timeout_secs {
                cfg.rpc_timeout = Duration::from_secs(secs);
            }
            if let Some(max) = file.max_contexts {
                cfg.max_contexts = max;
            }
            if let Some(id) = file.primary_group_id {
                cfg.primary_group_id = id;
            }
            cfg.validate().map_err(|e| Error::Config(e.to_string()))?;
            Ok(cfg)
        }

        /// Read and parse a YAML file.
        pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            Self::from_yaml_str(&text)
        }
    }
}
