//! HTTP client for the object-storage gateway.
//!
//! Artifacts are opaque blobs addressed by `(bucket, path)`. Uploads are
//! upserts at deterministic paths so worker retries after a crash land on
//! the same object; deletes are idempotent.

use std::path::Path;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use uuid::Uuid;

use crate::error::{JobError, Result};

/// Bucket holding raw client uploads until the worker consumes them.
pub const RAW_BUCKET: &str = "raw-inputs";
/// Bucket holding finished outputs until retention or the access cap.
pub const PROCESSED_BUCKET: &str = "processed-pdfs";

/// Storage path for one raw input of a job.
pub fn raw_input_path(job_id: Uuid, original_name: &str) -> String {
    format!("public/{job_id}/raw/{}", sanitize_file_name(original_name))
}

/// Storage path for the final output of a job.
pub fn processed_path(job_id: Uuid, file_name: &str) -> String {
    format!("public/{job_id}/{file_name}")
}

/// Keeps alphanumerics, dots, dashes and underscores; everything else
/// becomes an underscore so names survive URL paths and disposition
/// headers.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Clone)]
pub struct ArtifactStore {
    client: Client,
    base_url: String,
    service_key: String,
}

impl ArtifactStore {
    /// Creates a store client against `base_url` (no trailing slash). The
    /// service key authorizes writes and deletes; it is held here and
    /// never logged.
    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(JobError::from)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        })
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/object/{bucket}/{path}", self.base_url)
    }

    /// Publicly fetchable URL for an uploaded object.
    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/object/public/{bucket}/{path}", self.base_url)
    }

    /// Uploads `bytes` to `(bucket, path)` and returns the public URL.
    /// Upsert semantics make worker retries at the same path safe.
    pub async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        self.client
            .post(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .header("x-upsert", "true")
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
        Ok(self.public_url(bucket, path))
    }

    /// Fetches an object's bytes.
    pub async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Downloads an object into a local scratch file and returns its size.
    pub async fn download_to(&self, bucket: &str, path: &str, dest: &Path) -> Result<u64> {
        let bytes = self.download(bucket, path).await?;
        let len = bytes.len() as u64;
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|err| JobError::Storage(format!("writing {}: {err}", dest.display())))?;
        Ok(len)
    }

    /// Fetches an arbitrary artifact URL (used by the proxied download).
    /// Returns the body and the reported content type.
    pub async fn fetch(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok((resp.bytes().await?.to_vec(), content_type))
    }

    /// Deletes an object; a missing object counts as success.
    pub async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn store(server: &MockServer) -> ArtifactStore {
        ArtifactStore::new(&server.base_url(), "service-key", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn paths_are_deterministic_and_sanitized() {
        let id = Uuid::nil();
        assert_eq!(
            raw_input_path(id, "Kunden Akte (2024).pdf"),
            format!("public/{id}/raw/Kunden_Akte__2024_.pdf")
        );
        assert_eq!(
            processed_path(id, "DocSmart_merged_documents_00000000.pdf"),
            format!("public/{id}/DocSmart_merged_documents_00000000.pdf")
        );
        assert_eq!(sanitize_file_name("///"), "upload");
    }

    #[tokio::test]
    async fn upload_posts_bytes_and_returns_public_url() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/object/processed-pdfs/public/job/out.pdf")
                    .header("authorization", "Bearer service-key")
                    .header("x-upsert", "true")
                    .header("content-type", "application/pdf")
                    .body("%PDF-1.5");
                then.status(200);
            })
            .await;

        let url = store(&server)
            .upload(
                PROCESSED_BUCKET,
                "public/job/out.pdf",
                b"%PDF-1.5".to_vec(),
                "application/pdf",
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            url,
            format!(
                "{}/object/public/processed-pdfs/public/job/out.pdf",
                server.base_url()
            )
        );
    }

    #[tokio::test]
    async fn download_returns_object_bytes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/object/raw-inputs/public/job/raw/a.pdf");
                then.status(200).body("%PDF-1.5 raw");
            })
            .await;

        let bytes = store(&server)
            .download(RAW_BUCKET, "public/job/raw/a.pdf")
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-1.5 raw");
    }

    #[tokio::test]
    async fn delete_treats_missing_objects_as_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/object/processed-pdfs/public/job/out.pdf");
                then.status(404);
            })
            .await;

        store(&server)
            .delete(PROCESSED_BUCKET, "public/job/out.pdf")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_errors_surface_as_storage_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/object/raw-inputs/missing");
                then.status(500);
            })
            .await;

        let err = store(&server).download(RAW_BUCKET, "missing").await.unwrap_err();
        assert!(matches!(err, JobError::Storage(_)));
    }
}
