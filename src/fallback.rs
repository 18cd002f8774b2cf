//! Choosing between live, cached and default flags.
use std::sync::Arc;

use crate::{request::Outcome, FlagSnapshot, Result};

/// Where a resolved snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Live network response.
    Fresh,
    /// Valid cache entry.
    Cached,
    /// Caller-configured default flags.
    Default,
}

/// A resolved snapshot together with its provenance.
#[derive(Debug, Clone)]
pub struct Resolution {
    #[allow(missing_docs)]
    pub snapshot: Arc<FlagSnapshot>,
    #[allow(missing_docs)]
    pub provenance: Provenance,
}

/// Resolve a fetch `outcome` against `defaults`.
///
/// First match wins:
/// 1. a fresh or cached snapshot;
/// 2. on a fallback-eligible failure, the non-null entries of `defaults`, if there are any;
/// 3. the failure itself.
pub fn resolve(outcome: Outcome<FlagSnapshot>, defaults: &FlagSnapshot) -> Result<Resolution> {
    let err = match outcome {
        Outcome::Fresh(snapshot) => {
            return Ok(Resolution {
                snapshot: Arc::new(snapshot),
                provenance: Provenance::Fresh,
            })
        }
        Outcome::Cached(snapshot) => {
            return Ok(Resolution {
                snapshot: Arc::new(snapshot),
                provenance: Provenance::Cached,
            })
        }
        Outcome::Failure(err) => err,
    };

    if !err.is_fallback_eligible() {
        return Err(err);
    }

    let usable = defaults.without_null_values();
    if usable.is_empty() {
        return Err(err);
    }

    log::info!(target: "flagsync", flags = usable.len(); "serving default flags: {err}");
    Ok(Resolution {
        snapshot: Arc::new(usable),
        provenance: Provenance::Default,
    })
}
