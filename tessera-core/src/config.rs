//! Engine configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ConfigError, TesseraResult};
use crate::{DEFAULT_GLOBAL_ORGANISATION, PARTITION_SEPARATOR};

fn default_global_organisation() -> String {
    DEFAULT_GLOBAL_ORGANISATION.to_string()
}

fn default_flush_interval_ms() -> u64 {
    2
}

fn default_max_batch_items() -> usize {
    100
}

fn default_scan_page_size() -> usize {
    500
}

/// One tier of the inheritance chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Human name, e.g. `prod` or `staging`.
    pub name: String,
    /// Backing table.
    pub table: String,
}

impl TierConfig {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
        }
    }
}

/// Storage engine configuration.
///
/// `tiers` is ordered by ascending specificity; the last tier is the only one
/// ever written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub tiers: Vec<TierConfig>,
    #[serde(default = "default_global_organisation")]
    pub global_organisation: String,
    /// Dispatcher idle delay in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Physical keys per batched read.
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

impl EngineConfig {
    /// Single-tier configuration over `table`.
    pub fn single(table: impl Into<String>) -> Self {
        let table = table.into();
        Self::new(vec![TierConfig::new(table.clone(), table)])
    }

    pub fn new(tiers: Vec<TierConfig>) -> Self {
        Self {
            tiers,
            global_organisation: default_global_organisation(),
            flush_interval_ms: default_flush_interval_ms(),
            max_batch_items: default_max_batch_items(),
            scan_page_size: default_scan_page_size(),
        }
    }

    /// Append a tier; it becomes the active write tier.
    pub fn with_tier(mut self, name: impl Into<String>, table: impl Into<String>) -> Self {
        self.tiers.push(TierConfig::new(name, table));
        self
    }

    pub fn with_global_organisation(mut self, organisation_id: impl Into<String>) -> Self {
        self.global_organisation = organisation_id.into();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_batch_items(mut self, max_batch_items: usize) -> Self {
        self.max_batch_items = max_batch_items;
        self
    }

    pub fn with_scan_page_size(mut self, scan_page_size: usize) -> Self {
        self.scan_page_size = scan_page_size;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Index of the active write tier.
    pub fn active_tier(&self) -> usize {
        self.tiers.len().saturating_sub(1)
    }

    /// Logical keys per point-cache batch. Each key fans out to one probe per
    /// tier for the own tenant and again for the global tenant.
    pub fn max_batch_size(&self) -> usize {
        let fan_out = self.tiers.len().max(1) * 2;
        (self.max_batch_items / fan_out).max(1)
    }

    /// Parse from TOML.
    ///
    /// ```toml
    /// global_organisation = "global"
    /// flush_interval_ms = 2
    ///
    /// [[tiers]]
    /// name = "prod"
    /// table = "tbl_prod"
    /// ```
    pub fn from_toml_str(source: &str) -> TesseraResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `TESSERA_*` environment variables.
    ///
    /// `TESSERA_TIERS` is required and lists `name:table` pairs in ascending
    /// specificity, comma separated.
    pub fn from_env() -> TesseraResult<Self> {
        let tiers = std::env::var("TESSERA_TIERS").map_err(|_| ConfigError::MissingRequired {
            field: "TESSERA_TIERS".to_string(),
        })?;
        let mut config = Self::new(parse_tiers(&tiers)?);

        if let Ok(value) = std::env::var("TESSERA_GLOBAL_ORGANISATION") {
            config.global_organisation = value;
        }
        if let Some(value) = env_number("TESSERA_FLUSH_INTERVAL_MS")? {
            config.flush_interval_ms = value as u64;
        }
        if let Some(value) = env_number("TESSERA_MAX_BATCH_ITEMS")? {
            config.max_batch_items = value;
        }
        if let Some(value) = env_number("TESSERA_SCAN_PAGE_SIZE")? {
            config.scan_page_size = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.tiers.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "tiers".to_string(),
            }
            .into());
        }

        let mut tables = HashSet::new();
        for tier in &self.tiers {
            if tier.table.is_empty() {
                return Err(invalid("tiers.table", &tier.name, "table name must not be empty"));
            }
            if !tables.insert(tier.table.as_str()) {
                return Err(invalid("tiers.table", &tier.table, "tables must be unique"));
            }
        }

        if self.global_organisation.is_empty()
            || self.global_organisation.contains(PARTITION_SEPARATOR)
        {
            return Err(invalid(
                "global_organisation",
                &self.global_organisation,
                "must be non-empty and must not contain '#'",
            ));
        }

        if self.flush_interval_ms == 0 {
            return Err(invalid("flush_interval_ms", "0", "must be positive"));
        }
        if self.max_batch_items == 0 {
            return Err(invalid("max_batch_items", "0", "must be positive"));
        }
        if self.scan_page_size == 0 {
            return Err(invalid("scan_page_size", "0", "must be positive"));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::TesseraError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn parse_tiers(value: &str) -> TesseraResult<Vec<TierConfig>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((name, table)) if !name.is_empty() && !table.is_empty() => {
                Ok(TierConfig::new(name, table))
            }
            _ => Err(invalid("TESSERA_TIERS", pair, "expected name:table")),
        })
        .collect()
}

fn env_number(key: &str) -> TesseraResult<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, &e.to_string())),
        Err(_) => Ok(None),
    }
}
