use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::counter;
use reqwest::multipart::{Form, Part};
use sha2::{Digest, Sha256};
use tracing::warn;

use ingest_common::logcache::{ExcerptRef, LogCache};

use crate::error::UploadError;
use crate::metrics_consts::{EXCERPTS_DEDUPED, EXCERPTS_UPLOADED, EXCERPT_UPLOAD_FAILURES};
use crate::types::{HasLogExcerpt, ParsedSubmission, LOG_EXCERPT_FILE_NAME};

/// Remote store for compressed log excerpts, keyed by content digest.
#[async_trait]
pub trait ExcerptStore: Send + Sync {
    /// Upload gzipped excerpt bytes, returning the public reference URL.
    async fn upload(&self, digest: &str, gzipped: Vec<u8>) -> Result<String, UploadError>;
}

/// Storage-service client: multipart POST with a bearer token, one object
/// per digest under `logexcerpt/`.
pub struct HttpExcerptStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpExcerptStore {
    pub fn new(base_url: &str, token: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("submission-ingester")
            .build()
            .expect("failed to construct reqwest client for excerpt uploads");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
        }
    }
}

#[async_trait]
impl ExcerptStore for HttpExcerptStore {
    async fn upload(&self, digest: &str, gzipped: Vec<u8>) -> Result<String, UploadError> {
        let form = Form::new()
            .part(
                "file0",
                Part::bytes(gzipped).file_name(LOG_EXCERPT_FILE_NAME),
            )
            .text("path", format!("logexcerpt/{digest}"));

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(UploadError::Status(response.status()));
        }

        Ok(format!(
            "{}/logexcerpt/{digest}/{LOG_EXCERPT_FILE_NAME}",
            self.base_url
        ))
    }
}

/// Replaces large log excerpts on builds and tests with references to the
/// excerpt store, deduplicating identical excerpts through the shared cache.
///
/// The cache is consulted and updated around the upload, never across it:
/// two workers racing on a brand-new excerpt may both upload it, which is
/// tolerated.
pub struct ExcerptConverter {
    threshold: usize,
    cache: Arc<LogCache>,
    store: Arc<dyn ExcerptStore>,
}

impl ExcerptConverter {
    pub fn new(threshold: usize, cache: Arc<LogCache>, store: Arc<dyn ExcerptStore>) -> Self {
        Self {
            threshold,
            cache,
            store,
        }
    }

    pub async fn convert_submission(&self, parsed: &mut ParsedSubmission) {
        for build in &mut parsed.builds {
            self.convert_item(build).await;
        }
        for test in &mut parsed.tests {
            self.convert_item(test).await;
        }
        self.cache.maintain();
    }

    async fn convert_item<T: HasLogExcerpt>(&self, item: &mut T) {
        let Some(excerpt) = item.log_excerpt().map(str::to_owned) else {
            return;
        };
        if excerpt.len() <= self.threshold {
            return;
        }

        let digest = hex::encode(Sha256::digest(excerpt.as_bytes()));

        match self.cache.get(&digest) {
            Some(ExcerptRef::Uploaded(url)) => {
                counter!(EXCERPTS_DEDUPED).increment(1);
                item.set_excerpt_reference(url);
                return;
            }
            Some(ExcerptRef::Inline(_)) => {
                // A previous upload of this content failed; keep it inline
                // and do not try again.
                counter!(EXCERPTS_DEDUPED).increment(1);
                return;
            }
            None => {}
        }

        let gzipped = match gzip(&excerpt) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!("failed to compress log excerpt {}: {}", digest, error);
                counter!(EXCERPT_UPLOAD_FAILURES).increment(1);
                self.cache.put(digest, ExcerptRef::Inline(excerpt));
                return;
            }
        };

        match self.store.upload(&digest, gzipped).await {
            Ok(url) => {
                counter!(EXCERPTS_UPLOADED).increment(1);
                self.cache.put(digest, ExcerptRef::Uploaded(url.clone()));
                item.set_excerpt_reference(url);
            }
            Err(error) => {
                warn!("failed to upload log excerpt {}: {}", digest, error);
                counter!(EXCERPT_UPLOAD_FAILURES).increment(1);
                self.cache.put(digest, ExcerptRef::Inline(excerpt));
            }
        }
    }
}

fn gzip(text: &str) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    encoder.finish()
}
