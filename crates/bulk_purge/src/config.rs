//! Purge configuration: explicit struct, validated once at startup.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::document::Collation;
use crate::store::{BucketQuery, Filter, Namespace, SessionContext};
use crate::telemetry::TelemetryThresholds;

/// Records per delete batch unless overridden.
pub const DEFAULT_BUCKET_SIZE: usize = 100;
/// Lower bound of the default pool width.
pub const MIN_CONCURRENCY: usize = 4;

#[derive(Clone, Debug)]
pub struct PurgeConfig {
    pub database: String,
    pub collection: String,
    pub filter: Filter,
    /// Index hint forwarded to the store.
    pub hint: Option<String>,
    /// Collation name forwarded to the store (`simple` or `case_insensitive`).
    pub collation: Option<String>,
    /// When true, deletes run in transactions that are always aborted.
    pub safeguard: bool,
    pub bucket_size: usize,
    /// Pool width; `None` picks `max(4, cores)`.
    pub concurrency: Option<usize>,
    /// Extra attempts for a bucket whose delete hit a transient error.
    pub transient_retries: u32,
    /// Period of the running progress summary; `None` disables it.
    pub progress_interval: Option<Duration>,
    pub telemetry: TelemetryThresholds,
}

impl PurgeConfig {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            filter: Filter::match_all(),
            hint: None,
            collation: None,
            safeguard: true,
            bucket_size: DEFAULT_BUCKET_SIZE,
            concurrency: None,
            transient_retries: 0,
            progress_interval: None,
            telemetry: TelemetryThresholds::default(),
        }
    }

    /// Load from `BULK_PURGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup using the `BULK_PURGE_*` names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database = lookup("BULK_PURGE_DATABASE").context("BULK_PURGE_DATABASE is required")?;
        let collection =
            lookup("BULK_PURGE_COLLECTION").context("BULK_PURGE_COLLECTION is required")?;
        let mut config = Self::new(database, collection);

        if let Some(raw) = lookup("BULK_PURGE_FILTER") {
            config.filter = Filter::from_json_str(&raw).context("invalid BULK_PURGE_FILTER")?;
        }
        config.hint = lookup("BULK_PURGE_HINT").filter(|v| !v.is_empty());
        config.collation = lookup("BULK_PURGE_COLLATION").filter(|v| !v.is_empty());
        config.safeguard = parse_bool(lookup("BULK_PURGE_SAFEGUARD"), true)?;
        config.bucket_size =
            parse_usize(lookup("BULK_PURGE_BUCKET_SIZE"), DEFAULT_BUCKET_SIZE)?;
        config.concurrency = lookup("BULK_PURGE_CONCURRENCY")
            .map(|raw| parse_usize(Some(raw), 0))
            .transpose()?;
        config.transient_retries = parse_u32(lookup("BULK_PURGE_TRANSIENT_RETRIES"), 0)?;
        config.progress_interval = lookup("BULK_PURGE_PROGRESS_INTERVAL")
            .map(|raw| {
                humantime::parse_duration(&raw)
                    .with_context(|| format!("invalid duration value: {raw}"))
            })
            .transpose()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.database.trim().is_empty(), "database name is required");
        anyhow::ensure!(
            !self.collection.trim().is_empty(),
            "collection name is required"
        );
        anyhow::ensure!(self.bucket_size >= 1, "bucket size must be at least 1");
        if let Some(width) = self.concurrency {
            anyhow::ensure!(width >= 1, "concurrency must be at least 1");
        }
        Collation::parse(self.collation.as_deref()).context("invalid collation")?;
        for (name, t) in [
            ("cache", self.telemetry.cache),
            ("dirty", self.telemetry.dirty),
            ("updates", self.telemetry.updates),
            ("tickets", self.telemetry.tickets),
            ("checkpoint", self.telemetry.checkpoint),
        ] {
            anyhow::ensure!(
                t.target <= t.trigger,
                "{name} target {} exceeds trigger {}",
                t.target,
                t.trigger
            );
        }
        Ok(())
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.database.clone(), self.collection.clone())
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext::new(self.safeguard)
    }

    pub fn bucket_query(&self) -> BucketQuery {
        BucketQuery {
            filter: self.filter.clone(),
            bucket_size: self.bucket_size,
            hint: self.hint.clone(),
            collation: self.collation.clone(),
        }
    }

    pub fn concurrency_width(&self) -> usize {
        match self.concurrency {
            Some(width) => width.max(1),
            None => crate::scheduler::default_width(),
        }
    }
}

fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    match value {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("invalid bool value: {raw}"),
        },
        None => Ok(default_value),
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u32(value: Option<String>, default_value: u32) -> Result<u32> {
    match value {
        Some(raw) => raw
            .parse::<u32>()
            .with_context(|| format!("invalid u32 value: {raw}")),
        None => Ok(default_value),
    }
}
