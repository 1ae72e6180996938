//! Per-modem feature support cache.
//!
//! Vendor code probes optional commands (`AT^SGPSS=?`, `AT+CNMI=?`, ...)
//! once and branches on the answer for the lifetime of the modem. Each named
//! feature starts out [`Unknown`](FeatureSupport::Unknown) and moves to
//! `Supported` or `NotSupported` exactly once; only [`FeatureCache::reset`]
//! brings it back, which is what a SIM hot-swap re-initialization does.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;
use tracing::debug;

use mmlib_core::error::{Error, Result};
use mmlib_core::types::FeatureSupport;

type Cell = Arc<OnceCell<FeatureSupport>>;

/// Tri-state support flags keyed by feature name.
#[derive(Debug, Default)]
pub struct FeatureCache {
    cells: Mutex<HashMap<String, Cell>>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Cell>> {
        self.cells.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cell(&self, feature: &str) -> Cell {
        Arc::clone(self.lock().entry(feature.to_string()).or_default())
    }

    /// Current state of `feature`, without probing.
    pub fn get(&self, feature: &str) -> FeatureSupport {
        self.lock()
            .get(feature)
            .and_then(|cell| cell.get().copied())
            .unwrap_or_default()
    }

    /// Record the state of a feature that is still unknown.
    ///
    /// Returns `false`, leaving the cache unchanged, if the feature was
    /// already decided.
    pub fn set(&self, feature: &str, supported: bool) -> bool {
        self.cell(feature).set(supported.into()).is_ok()
    }

    /// Return the cached state of `feature`, running `probe` first if it is
    /// unknown.
    ///
    /// A probe error means the feature is not supported; the error itself
    /// is logged and dropped. A cancelled probe decides nothing and leaves
    /// the feature [`Unknown`](FeatureSupport::Unknown) for the next caller.
    /// Concurrent callers share one probe run.
    pub async fn get_or_probe<F, Fut>(&self, feature: &str, probe: F) -> FeatureSupport
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let cell = self.cell(feature);
        let probed = cell
            .get_or_try_init(|| async move {
                let support = match probe().await {
                    Ok(_) => FeatureSupport::Supported,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        debug!(feature, error = %e, "feature probe failed");
                        FeatureSupport::NotSupported
                    }
                };
                debug!(feature, ?support, "feature probed");
                Ok(support)
            })
            .await;
        match probed {
            Ok(support) => *support,
            Err(_) => {
                debug!(feature, "feature probe cancelled");
                FeatureSupport::Unknown
            }
        }
    }

    /// Fail with [`Error::Unsupported`] if `feature` is known to be missing.
    pub fn require(&self, feature: &str) -> Result<()> {
        match self.get(feature) {
            FeatureSupport::NotSupported => Err(Error::Unsupported(feature.to_string())),
            _ => Ok(()),
        }
    }

    /// Forget every feature.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Forget a single feature.
    pub fn reset_feature(&self, feature: &str) {
        self.lock().remove(feature);
    }
}
