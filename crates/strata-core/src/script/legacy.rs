//! Compatibility surface for scripts written against the older helper API.
//!
//! Older scripts call helpers as `helper(env, ...)`, passing a target
//! description first. The engine binds helpers to the current target, so the
//! adapter accepts that argument and ignores it.

use std::path::Path;

use serde::Serialize;

use super::Helpers;
use crate::remote::RemoteApi;

/// Snapshot of the target in the shape older scripts expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEnv {
    pub server: String,
    pub client_id: String,
    pub code_version: Option<String>,
}

impl LegacyEnv {
    pub fn from_target(remote: &dyn RemoteApi, identity: &str) -> Self {
        let info = remote.info();
        Self {
            server: info.server,
            client_id: identity.to_string(),
            code_version: info.code_version,
        }
    }
}

/// Positional-`env` wrappers over [`Helpers`].
pub struct LegacyHelpers<'a> {
    helpers: &'a Helpers<'a>,
}

impl<'a> LegacyHelpers<'a> {
    pub(crate) fn new(helpers: &'a Helpers<'a>) -> Self {
        Self { helpers }
    }

    pub async fn site_archive_import(&self, _env: &LegacyEnv, dir: &Path) -> anyhow::Result<()> {
        self.helpers.import_dir(dir).await
    }

    pub async fn site_archive_import_text(
        &self,
        _env: &LegacyEnv,
        name: &str,
        documents: &[(&str, String)],
    ) -> anyhow::Result<()> {
        self.helpers.import_documents(name, documents).await
    }

    pub async fn upload_file(
        &self,
        _env: &LegacyEnv,
        path: &str,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.helpers.upload_file(path, body).await
    }
}
