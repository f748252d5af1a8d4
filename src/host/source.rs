//! Deployment sources
//!
//! Where the host looks for the current deployment descriptor: an HTTP
//! endpoint on the origin or a local file written by deployment tooling.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::{Client, Url};
use tracing::debug;

use crate::agent::Deployment;

/// How deployment probes interact with intermediate HTTP caches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateViaCache {
    /// Always revalidate with the origin
    #[default]
    None,
    /// Let HTTP caches answer probes
    All,
}

/// Deployment source error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to fetch deployment: {0}")]
    Fetch(String),

    #[error("Invalid deployment descriptor: {0}")]
    Invalid(String),
}

/// Provides the currently deployed descriptor
#[async_trait]
pub trait DeploymentSource: Send + Sync {
    async fn fetch_deployment(&self, mode: UpdateViaCache) -> Result<Deployment, SourceError>;
}

/// Deployment descriptor served over HTTP
pub struct HttpDeploymentSource {
    http_client: Client,
    url: Url,
}

impl HttpDeploymentSource {
    pub fn new(url: Url, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl DeploymentSource for HttpDeploymentSource {
    async fn fetch_deployment(&self, mode: UpdateViaCache) -> Result<Deployment, SourceError> {
        let mut request = self.http_client.get(self.url.clone());
        if mode == UpdateViaCache::None {
            request = request.header(CACHE_CONTROL, "no-cache").header(PRAGMA, "no-cache");
        }

        debug!(url = %self.url, ?mode, "Probing for deployment");

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Fetch(format!("HTTP {} from {}", status.as_u16(), self.url)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Fetch(e.to_string()))?;

        Deployment::from_json(&body).map_err(|e| SourceError::Invalid(e.to_string()))
    }
}

/// Deployment descriptor read from a local file
pub struct FileDeploymentSource {
    path: PathBuf,
}

impl FileDeploymentSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeploymentSource for FileDeploymentSource {
    async fn fetch_deployment(&self, _mode: UpdateViaCache) -> Result<Deployment, SourceError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SourceError::Fetch(format!("{}: {}", self.path.display(), e)))?;

        Deployment::from_json(&data).map_err(|e| SourceError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;

    const DESCRIPTOR: &str =
        r#"{"version":"4","staticResources":["/"],"audioResources":["/audio/a.mp3"]}"#;

    #[tokio::test]
    async fn test_http_source_bypasses_caches() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method("GET")
                    .path("/deployment.json")
                    .header("cache-control", "no-cache")
                    .header("pragma", "no-cache");
                then.status(200).body(DESCRIPTOR);
            })
            .await;

        let url = Url::parse(&server.url("/deployment.json")).unwrap();
        let source = HttpDeploymentSource::new(url, Duration::from_secs(5)).unwrap();
        let deployment = source.fetch_deployment(UpdateViaCache::None).await.unwrap();

        mock.assert_async().await;
        assert_eq!(deployment.version, "4");
        assert_eq!(deployment.manifest.audio_resources, vec!["/audio/a.mp3"]);
    }

    #[tokio::test]
    async fn test_http_source_rejects_error_status_and_bad_json() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method("GET").path("/missing.json");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method("GET").path("/broken.json");
                then.status(200).body("{not json");
            })
            .await;

        let missing = HttpDeploymentSource::new(
            Url::parse(&server.url("/missing.json")).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(
            missing.fetch_deployment(UpdateViaCache::All).await,
            Err(SourceError::Fetch(_))
        ));

        let broken = HttpDeploymentSource::new(
            Url::parse(&server.url("/broken.json")).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(
            broken.fetch_deployment(UpdateViaCache::All).await,
            Err(SourceError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_file_source_reads_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployment.json");
        std::fs::write(&path, DESCRIPTOR).unwrap();

        let source = FileDeploymentSource::new(&path);
        let deployment = source.fetch_deployment(UpdateViaCache::None).await.unwrap();
        assert_eq!(deployment.version, "4");

        let missing = FileDeploymentSource::new(dir.path().join("absent.json"));
        assert!(matches!(
            missing.fetch_deployment(UpdateViaCache::None).await,
            Err(SourceError::Fetch(_))
        ));
    }
}
