//! Client configuration.
//!
//! Values come from an optional config file layered with `TABLESTORE_*`
//! environment variables. Every field has a default so an empty source
//! yields a usable configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of the environment variables read by [`StorageConfig::load`]
pub const ENV_PREFIX: &str = "TABLESTORE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub table_name: String,
    /// Opaque connection string handed to the transport connector
    pub connection_string: Option<String>,
    /// Upper bound for a single transport call
    pub max_execution_time_ms: u64,
    pub on_modification_retry_count: u32,
    pub on_getting_retry_count: u32,
    pub retry_delay_ms: u64,
    /// Status codes that are never retried
    pub no_retry_status_codes: Vec<u16>,
    pub retry_on_timeout: bool,
    /// Wrap the table in a write-through in-memory mirror
    pub enable_cache: bool,
    pub batch_limit: usize,
    /// Keys per scatter-gather query
    pub piece_size: usize,
    pub blob_on_modification_retry_count: u32,
    pub blob_on_getting_retry_count: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            table_name: "entities".to_string(),
            connection_string: None,
            max_execution_time_ms: 5000,
            on_modification_retry_count: 10,
            on_getting_retry_count: 1,
            retry_delay_ms: 200,
            no_retry_status_codes: vec![crate::error::CONFLICT, crate::error::BAD_REQUEST],
            retry_on_timeout: true,
            enable_cache: false,
            batch_limit: crate::batch::BATCH_LIMIT_PER_PARTITION,
            piece_size: 100,
            blob_on_modification_retry_count: 10,
            blob_on_getting_retry_count: 10,
        }
    }
}

impl StorageConfig {
    pub fn for_table(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Reject values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.table_name.trim().is_empty() {
            return Err(Error::Configuration("table_name must not be empty".into()));
        }
        if self.max_execution_time_ms == 0 {
            return Err(Error::Configuration(
                "max_execution_time_ms must be greater than 0".into(),
            ));
        }
        if self.on_modification_retry_count < 1 || self.on_getting_retry_count < 1 {
            return Err(Error::Configuration(
                "retry counts must be greater than 0".into(),
            ));
        }
        if self.blob_on_modification_retry_count < 1 || self.blob_on_getting_retry_count < 1 {
            return Err(Error::Configuration(
                "blob retry counts must be greater than 0".into(),
            ));
        }
        if self.batch_limit == 0 || self.batch_limit > crate::batch::BATCH_LIMIT_PER_PARTITION {
            return Err(Error::Configuration(format!(
                "batch_limit must be within 1..={}",
                crate::batch::BATCH_LIMIT_PER_PARTITION
            )));
        }
        if self.piece_size == 0 {
            return Err(Error::Configuration("piece_size must be greater than 0".into()));
        }
        Ok(())
    }

    /// Load from an optional file plus `TABLESTORE_*` environment variables.
    /// Environment values win over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("no_retry_status_codes"),
        );

        let loaded: StorageConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Configuration(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }
}
