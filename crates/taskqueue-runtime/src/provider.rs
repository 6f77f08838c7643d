//! Provider types and configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Enumeration of supported backing stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    InMemory,
    Filesystem,
}

impl ProviderType {
    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::InMemory => 10 * 1024 * 1024,  // 10MB
            Self::Filesystem => 4 * 1024 * 1024, // 4MB
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InMemory => write!(f, "in-memory"),
            Self::Filesystem => write!(f, "filesystem"),
        }
    }
}

/// Store-side policy applied when a delivery is rejected
///
/// Retry counts live with the stored entry, not in the message envelope. Once
/// an entry has been delivered `max_delivery_count` times a further reject
/// moves it to the dead-letter set instead of requeueing it.
///
/// A delivery that is neither acknowledged nor rejected within
/// `visibility_timeout_ms` is reclaimed by the next fetch, so deliveries held
/// by a consumer that vanished without closing are handed out again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    pub max_delivery_count: u32,
    pub enable_dead_letter_queue: bool,
    /// Delay before a rejected entry becomes deliverable again
    pub redelivery_delay_ms: u64,
    /// Lease duration of a delivered entry
    pub visibility_timeout_ms: u64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_delivery_count: 5,
            enable_dead_letter_queue: true,
            redelivery_delay_ms: 1000,
            visibility_timeout_ms: 30_000,
        }
    }
}

impl RedeliveryPolicy {
    /// Check if an entry delivered `delivery_count` times should be dead-lettered
    pub fn should_dead_letter(&self, delivery_count: u32) -> bool {
        self.enable_dead_letter_queue && delivery_count >= self.max_delivery_count
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.enable_dead_letter_queue && self.max_delivery_count == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_delivery_count must be at least 1 when the dead-letter queue is enabled"
                    .to_string(),
            });
        }
        if self.visibility_timeout_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "visibility_timeout_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for opening a connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub provider: ProviderConfig,
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.provider.validate()
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    InMemory(InMemoryConfig),
    Filesystem(FilesystemConfig),
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::InMemory(InMemoryConfig::default())
    }
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::InMemory(_) => ProviderType::InMemory,
            Self::Filesystem(_) => ProviderType::Filesystem,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::InMemory(config) => config.validate(),
            Self::Filesystem(config) => config.validate(),
        }
    }
}

/// In-memory provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Upper bound on ready plus unacknowledged entries per queue
    pub max_queue_size: usize,
    pub redelivery: RedeliveryPolicy,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

impl InMemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_queue_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_queue_size must be greater than zero".to_string(),
            });
        }
        self.redelivery.validate()
    }
}

/// Filesystem provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Root directory; each queue gets its own subdirectory
    pub data_dir: PathBuf,
    pub redelivery: RedeliveryPolicy,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/taskqueue"),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

impl FilesystemConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "data_dir".to_string(),
            });
        }
        self.redelivery.validate()
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
