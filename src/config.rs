use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

use crate::checkpoint::PersistPolicy;
use crate::ratelimit::RateLimitConfig;

pub struct Config;

impl Config {
    /// Get the data directory path
    fn data_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "repo-classify", "repo-classify")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("Could not determine data directory")
    }

    /// Get the database file path
    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("repos.db"))
    }

    /// Get GitHub token from environment or gh CLI config
    pub fn github_token() -> Option<String> {
        // First try environment variable
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }

        // Try GH_TOKEN (used by gh CLI)
        if let Ok(token) = std::env::var("GH_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }

        // Try to get from gh CLI config
        if let Ok(output) = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
        {
            if output.status.success() {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }

        None
    }
}

/// Knobs for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Entities per checkpointed batch
    pub batch_size: usize,
    /// Concurrent fetches within a batch
    pub parallelism: usize,
    /// Process at most this many pending entities
    pub limit: Option<usize>,
    /// Transient exhaustions before an entity is failed for good
    pub max_entity_retries: u32,
    /// Re-enumerate the work list instead of using the stored snapshot
    pub refresh_work_list: bool,
    /// Give permanently failed transient entities another budget
    pub retry_failed: bool,
    pub lease_ttl: chrono::Duration,
    pub rate_limit: RateLimitConfig,
    pub persist: PersistPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            parallelism: 1,
            limit: None,
            max_entity_retries: 3,
            refresh_work_list: false,
            retry_failed: false,
            lease_ttl: chrono::Duration::minutes(10),
            rate_limit: RateLimitConfig::default(),
            persist: PersistPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be at least 1");
        }
        if self.parallelism == 0 {
            anyhow::bail!("parallelism must be at least 1");
        }
        if self.max_entity_retries == 0 {
            anyhow::bail!("max entity retries must be at least 1");
        }
        if self.limit == Some(0) {
            anyhow::bail!("limit must be at least 1 when given");
        }
        if self.persist.attempts == 0 {
            anyhow::bail!("persistence attempts must be at least 1");
        }
        if self.lease_ttl <= chrono::Duration::zero() {
            anyhow::bail!("lease ttl must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.max_entity_retries, 3);
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = PipelineConfig { batch_size: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { parallelism: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { max_entity_retries: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { limit: Some(0), ..Default::default() };
        assert!(config.validate().is_err());
    }
}
