//! Command-line driver for bulk purges against a local fjall-backed store.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bulk_purge::store::{DocumentStore, Namespace};
use bulk_purge::{FjallStore, FjallStoreConfig, PurgeConfig, TelemetrySampler};
use clap::{Args as ClapArgs, Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "purgectl")]
#[command(about = "Congestion-aware bulk delete for document collections", long_about = None)]
struct Args {
    /// Directory of the fjall keyspace.
    #[arg(long, default_value = ".bulk_purge/data")]
    data_dir: PathBuf,
    /// Block cache size in MiB.
    #[arg(long, default_value_t = 64)]
    cache_mb: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Delete every document matching the filter.
    Run {
        #[command(flatten)]
        target: TargetArgs,
        /// Roll back every delete (default true). Pass `--safeguard false` to delete for real.
        #[arg(long, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
        safeguard: Option<bool>,
        #[arg(long)]
        hint: Option<String>,
        #[arg(long)]
        bucket_size: Option<usize>,
        /// Pool width; defaults to max(4, cores).
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        transient_retries: Option<u32>,
        /// Interval between progress summaries, e.g. `30s`.
        #[arg(long)]
        progress_interval: Option<humantime::Duration>,
    },
    /// Count documents matching the filter.
    Count {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print one congestion snapshot as JSON.
    Status,
    /// Insert synthetic documents to rehearse a purge.
    Seed {
        #[arg(long)]
        database: String,
        #[arg(long)]
        collection: String,
        #[arg(long, default_value_t = 10_000)]
        count: usize,
        /// Percent of documents tagged `"status": "expired"`.
        #[arg(long, default_value_t = 50)]
        expired_pct: u8,
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

/// Namespace and filter; unset flags fall back to `BULK_PURGE_*` variables.
#[derive(ClapArgs)]
struct TargetArgs {
    #[arg(long)]
    database: Option<String>,
    #[arg(long)]
    collection: Option<String>,
    /// Filter as a JSON object, e.g. `{"status": "expired"}`.
    #[arg(long)]
    filter: Option<String>,
    /// `simple` or `case_insensitive`.
    #[arg(long)]
    collation: Option<String>,
}

impl TargetArgs {
    fn overrides(self) -> HashMap<&'static str, String> {
        let mut out = HashMap::new();
        let pairs = [
            ("BULK_PURGE_DATABASE", self.database),
            ("BULK_PURGE_COLLECTION", self.collection),
            ("BULK_PURGE_FILTER", self.filter),
            ("BULK_PURGE_COLLATION", self.collation),
        ];
        for (key, value) in pairs {
            if let Some(value) = value {
                out.insert(key, value);
            }
        }
        out
    }
}

/// Flags win over environment variables.
fn load_config(overrides: HashMap<&'static str, String>) -> anyhow::Result<PurgeConfig> {
    PurgeConfig::from_lookup(|key| overrides.get(key).cloned().or_else(|| std::env::var(key).ok()))
}

fn init_tracing() {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulk_purge=info,purgectl=info,warn".into()),
        )
        .init();
}

fn seed_documents(count: usize, expired_pct: u8, seed: u64) -> Vec<(String, serde_json::Map<String, Value>)> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let expired_pct = expired_pct.min(100);
    (0..count)
        .filter_map(|i| {
            let status = if rng.gen_range(0..100u8) < expired_pct {
                "expired"
            } else {
                "active"
            };
            match json!({"seq": i, "status": status, "size": rng.gen_range(1..4096u32)}) {
                Value::Object(doc) => Some((format!("doc-{i:08}"), doc)),
                _ => None,
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut store_config = FjallStoreConfig::new(&args.data_dir);
    store_config.cache_size_bytes = args.cache_mb * 1024 * 1024;
    let store = FjallStore::open(store_config)
        .with_context(|| format!("open store at {}", args.data_dir.display()))?;

    match args.command {
        Command::Run {
            target,
            safeguard,
            hint,
            bucket_size,
            concurrency,
            transient_retries,
            progress_interval,
        } => {
            let mut overrides = target.overrides();
            if let Some(hint) = hint {
                overrides.insert("BULK_PURGE_HINT", hint);
            }
            if let Some(safeguard) = safeguard {
                overrides.insert("BULK_PURGE_SAFEGUARD", safeguard.to_string());
            }
            if let Some(size) = bucket_size {
                overrides.insert("BULK_PURGE_BUCKET_SIZE", size.to_string());
            }
            if let Some(width) = concurrency {
                overrides.insert("BULK_PURGE_CONCURRENCY", width.to_string());
            }
            if let Some(retries) = transient_retries {
                overrides.insert("BULK_PURGE_TRANSIENT_RETRIES", retries.to_string());
            }
            if let Some(interval) = progress_interval {
                overrides.insert("BULK_PURGE_PROGRESS_INTERVAL", interval.to_string());
            }
            let config = load_config(overrides)?;
            let report = bulk_purge::run(Arc::new(store), &config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Count { target } => {
            let config = load_config(target.overrides())?;
            config.validate()?;
            let verification = bulk_purge::verifier::verify(
                &store,
                &config.namespace(),
                &config.filter,
                config.collation.as_deref(),
                false,
            )
            .await?;
            println!("{}", verification.residual);
        }
        Command::Status => {
            let shared: Arc<dyn DocumentStore> = Arc::new(store);
            let sampler = TelemetrySampler::new(shared, Default::default());
            let snapshot = sampler.sample().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Seed {
            database,
            collection,
            count,
            expired_pct,
            seed,
        } => {
            let ns = Namespace::new(database, collection);
            let docs = seed_documents(count, expired_pct, seed);
            let mut inserted = 0usize;
            for chunk in docs.chunks(10_000) {
                inserted += store
                    .insert_many(&ns, chunk.iter().cloned())
                    .with_context(|| format!("seed {ns}"))?;
            }
            tracing::info!(namespace = %ns, inserted, "seeded {inserted} documents into {ns}");
            println!("ok");
        }
    }
    Ok(())
}
