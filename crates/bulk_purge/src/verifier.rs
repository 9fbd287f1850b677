//! Post-run residual count.

use anyhow::Context;
use serde::Serialize;

use crate::store::{DocumentStore, Filter, Namespace, ReadConcern};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Verification {
    /// Records still matching the filter.
    pub residual: u64,
    /// True when the run was simulated and nothing was meant to be removed.
    pub simulated: bool,
}

/// Recount `filter` with a relaxed read so the answer does not wait on the
/// majority commit point.
pub async fn verify(
    store: &dyn DocumentStore,
    ns: &Namespace,
    filter: &Filter,
    collation: Option<&str>,
    simulate: bool,
) -> anyhow::Result<Verification> {
    let residual = store
        .count_matching(ns, filter, collation, ReadConcern::Available)
        .await
        .with_context(|| format!("count residual documents in {ns}"))?;

    tracing::info!(
        namespace = %ns,
        residual,
        "{residual} documents matching the filter remain in {ns}"
    );
    if simulate {
        tracing::info!("safeguard enabled: deletes were rolled back and nothing was removed");
    }
    Ok(Verification {
        residual,
        simulated: simulate,
    })
}
