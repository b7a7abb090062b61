use tracing::debug;

use crate::error::Result;
use crate::state::{StateStore, merge_applied};
use crate::types::StateScope;

/// Applied-set access for one state scope.
///
/// Commits never replace the remote list blindly: the current remote set is
/// re-read and unioned with the local one first, so units recorded by a
/// concurrent writer survive. A feature instance that does not exist yet is
/// never created here; its units are held locally and written with the
/// instance once the deployment succeeds.
pub(crate) struct Ledger<'a> {
    store: StateStore,
    scope: &'a StateScope,
}

impl<'a> Ledger<'a> {
    pub(crate) fn new(store: StateStore, scope: &'a StateScope) -> Self {
        Self { store, scope }
    }

    pub(crate) async fn read(&self) -> Result<Vec<String>> {
        match self.scope {
            StateScope::Project => Ok(self
                .store
                .read()
                .await?
                .map(|state| state.applied_units)
                .unwrap_or_default()),
            StateScope::Feature(name) => self.store.read_feature_applied_units(name).await,
        }
    }

    /// Merge `local` into the remote set and write it back.
    pub(crate) async fn commit(&self, local: &[String]) -> Result<Vec<String>> {
        let remote = self.read().await?;
        let merged = merge_applied(&remote, local);
        match self.scope {
            StateScope::Project => self.store.write_applied_units(&merged).await?,
            StateScope::Feature(name) => {
                if !self.store.patch_feature_applied_units(name, &merged).await? {
                    debug!(feature = %name, "instance not deployed yet, holding applied units");
                }
            }
        }
        Ok(merged)
    }
}
