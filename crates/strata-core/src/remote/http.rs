//! HTTP adapter for [`RemoteApi`].
//!
//! Maps the generic record operations onto a JSON REST surface rooted at
//! the target's base URL:
//!
//! | operation        | request                                   |
//! |------------------|-------------------------------------------|
//! | preferences      | `GET/PATCH {base}/preferences`            |
//! | object           | `GET/PUT/PATCH/DELETE {base}/objects/{type}/{key}` |
//! | search           | `GET {base}/objects/{type}`               |
//! | archive import   | `POST {base}/imports/{name}`              |
//! | file upload      | `PUT {base}/files/{path}`                 |
//! | code upload      | `PUT {base}/code/{name}`                  |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use url::Url;

use super::{Attributes, RemoteApi, RemoteError, RemoteObject, TargetInfo};

const USER_AGENT: &str = concat!("strata/", env!("CARGO_PKG_VERSION"));

/// Remote target reached over HTTP with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    code_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectDocument {
    key: String,
    #[serde(default)]
    attributes: Attributes,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SearchDocument {
    #[serde(default)]
    hits: Vec<ObjectDocument>,
}

impl From<ObjectDocument> for RemoteObject {
    fn from(doc: ObjectDocument) -> Self {
        Self {
            key: doc.key,
            attributes: doc.attributes,
            created_at: doc.created_at,
            last_modified_at: doc.last_modified_at,
        }
    }
}

impl HttpRemote {
    pub fn new(
        base: Url,
        token: Option<String>,
        code_version: Option<String>,
    ) -> anyhow::Result<Self> {
        if base.cannot_be_a_base() {
            anyhow::bail!("Invalid target URL: {}", base);
        }
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base,
            token,
            code_version,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::new(0, format!("Invalid target URL: {}", self.base)))?
            .pop_if_empty()
            .extend(segments.iter().flat_map(|s| s.split('/')).filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::new(e.status().map_or(0, |s| s.as_u16()), e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = extract_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string()
        });
        Err(RemoteError::new(status.as_u16(), message))
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, RemoteError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::new(0, format!("Failed to parse response: {}", e)))
    }
}

/// Pull a human-readable message out of an error body when it is JSON.
fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/fault/message")
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
}

#[async_trait]
impl RemoteApi for HttpRemote {
    fn info(&self) -> TargetInfo {
        TargetInfo {
            server: self.base.host_str().unwrap_or_default().to_string(),
            code_version: self.code_version.clone(),
        }
    }

    async fn get_preferences(&self) -> Result<Attributes, RemoteError> {
        let url = self.endpoint(&["preferences"])?;
        self.json(self.client.get(url)).await
    }

    async fn patch_preferences(&self, attributes: Attributes) -> Result<(), RemoteError> {
        let url = self.endpoint(&["preferences"])?;
        self.send(self.client.patch(url).json(&attributes)).await?;
        Ok(())
    }

    async fn get_object(&self, object_type: &str, key: &str) -> Result<RemoteObject, RemoteError> {
        let url = self.endpoint(&["objects", object_type, key])?;
        let doc: ObjectDocument = self.json(self.client.get(url)).await?;
        Ok(doc.into())
    }

    async fn search_objects(&self, object_type: &str) -> Result<Vec<RemoteObject>, RemoteError> {
        let url = self.endpoint(&["objects", object_type])?;
        let doc: SearchDocument = self.json(self.client.get(url)).await?;
        Ok(doc.hits.into_iter().map(RemoteObject::from).collect())
    }

    async fn create_object(
        &self,
        object_type: &str,
        key: &str,
        attributes: Attributes,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&["objects", object_type, key])?;
        self.send(self.client.put(url).json(&attributes)).await?;
        Ok(())
    }

    async fn patch_object(
        &self,
        object_type: &str,
        key: &str,
        attributes: Attributes,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&["objects", object_type, key])?;
        self.send(self.client.patch(url).json(&attributes)).await?;
        Ok(())
    }

    async fn delete_object(&self, object_type: &str, key: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&["objects", object_type, key])?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn import_archive(&self, name: &str, archive: Vec<u8>) -> Result<(), RemoteError> {
        let url = self.endpoint(&["imports", name])?;
        self.send(
            self.client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/zip")
                .body(archive),
        )
        .await?;
        Ok(())
    }

    async fn upload_file(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError> {
        let url = self.endpoint(&["files", path])?;
        self.send(self.client.put(url).body(body)).await?;
        Ok(())
    }

    async fn upload_code(&self, name: &str, archive: Vec<u8>) -> Result<(), RemoteError> {
        let mut segments = vec!["code"];
        if let Some(version) = &self.code_version {
            segments.push(version);
        }
        segments.push(name);
        let url = self.endpoint(&segments)?;
        self.send(
            self.client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, "application/zip")
                .body(archive),
        )
        .await?;
        Ok(())
    }
}
