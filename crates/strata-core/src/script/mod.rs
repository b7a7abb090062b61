//! Executable units, hook scripts, and the argument bundle they receive.
//!
//! Scripts are resolved through a [`ScriptLoader`]; two loaders ship here:
//! - [`RegistryLoader`] binds in-process implementations to script paths
//! - [`CommandLoader`] runs script files as child processes

pub mod command;
pub mod legacy;
pub mod registry;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::archive;
use crate::error::Result;
use crate::hooks::{FeatureHooks, LifecycleHooks};
use crate::remote::{Attributes, RemoteApi};
use crate::runlog::RunLog;
use crate::types::VarMap;

pub use command::CommandLoader;
pub use legacy::{LegacyEnv, LegacyHelpers};
pub use registry::{FnScript, RegistryLoader};

/// The stable argument bundle every unit script and hook receives.
pub struct ScriptContext<'a> {
    pub remote: &'a dyn RemoteApi,
    pub log: &'a RunLog,
    pub helpers: Helpers<'a>,
    pub vars: &'a VarMap,
    pub env: LegacyEnv,
}

impl<'a> ScriptContext<'a> {
    pub fn new(
        remote: &'a dyn RemoteApi,
        identity: &str,
        log: &'a RunLog,
        vars: &'a VarMap,
    ) -> Self {
        Self {
            remote,
            log,
            helpers: Helpers { remote, log },
            vars,
            env: LegacyEnv::from_target(remote, identity),
        }
    }

    /// Helpers in the older `helper(env, ...)` calling convention.
    pub fn legacy(&self) -> LegacyHelpers<'_> {
        LegacyHelpers::new(&self.helpers)
    }
}

/// Convenience operations bound to the current target.
#[derive(Clone, Copy)]
pub struct Helpers<'a> {
    remote: &'a dyn RemoteApi,
    log: &'a RunLog,
}

impl Helpers<'_> {
    /// Import a local directory through the archive-import channel.
    pub async fn import_dir(&self, dir: &Path) -> anyhow::Result<()> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow::anyhow!("Cannot import {}: no directory name", dir.display()))?;
        let data = archive::from_dir(&name, dir)
            .with_context(|| format!("Failed to package {}", dir.display()))?;
        self.log.info(format!("importing archive {name}"));
        self.remote
            .import_archive(&name, data)
            .await
            .with_context(|| format!("Failed to import {}", dir.display()))
    }

    /// Import in-memory documents as an archive named `name`.
    pub async fn import_documents(
        &self,
        name: &str,
        documents: &[(&str, String)],
    ) -> anyhow::Result<()> {
        let data = archive::from_documents(name, documents)?;
        self.log.info(format!("importing archive {name}"));
        self.remote
            .import_archive(name, data)
            .await
            .with_context(|| format!("Failed to import archive {name}"))
    }

    pub async fn read_preferences(&self) -> anyhow::Result<Attributes> {
        Ok(self.remote.get_preferences().await?)
    }

    pub async fn patch_preferences(&self, attributes: Attributes) -> anyhow::Result<()> {
        Ok(self.remote.patch_preferences(attributes).await?)
    }

    pub async fn upload_file(&self, path: &str, body: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.remote.upload_file(path, body).await?)
    }
}

/// A loaded executable unit.
#[async_trait]
pub trait UnitScript: Send + Sync {
    async fn run(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()>;
}

/// Resolves script files into runnable values.
///
/// Implementations check what they load: a unit that does not yield a
/// callable must fail with [`crate::Error::InvalidUnit`].
#[async_trait]
pub trait ScriptLoader: Send + Sync {
    async fn load_unit(&self, path: &Path) -> Result<Arc<dyn UnitScript>>;

    async fn load_hooks(&self, path: &Path) -> Result<Arc<dyn LifecycleHooks>>;

    async fn load_feature_hooks(&self, path: &Path) -> Result<Arc<dyn FeatureHooks>>;
}

/// Unit id for error messages from a script path.
pub(crate) fn unit_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    #[tokio::test]
    async fn import_dir_uses_directory_name() {
        let temp = tempfile::TempDir::new().unwrap();
        let unit = temp.path().join("0001-site");
        std::fs::create_dir_all(&unit).unwrap();
        std::fs::write(unit.join("data.xml"), "<x/>").unwrap();

        let remote = MemoryRemote::provisioned();
        let log = RunLog::new();
        let vars = VarMap::new();
        let ctx = ScriptContext::new(&remote, "client", &log, &vars);

        ctx.helpers.import_dir(&unit).await.unwrap();

        let imports = remote.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].name, "0001-site");
        assert_eq!(imports[0].entries, vec!["0001-site/data.xml"]);
    }

    #[tokio::test]
    async fn import_documents_surfaces_remote_status() {
        let remote = MemoryRemote::provisioned();
        remote.fail_imports(crate::remote::RemoteError::new(500, "broken"));
        let log = RunLog::new();
        let vars = VarMap::new();
        let ctx = ScriptContext::new(&remote, "client", &log, &vars);

        let err = ctx
            .helpers
            .import_documents("x", &[("a.xml", "<a/>".to_string())])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
    }
}
