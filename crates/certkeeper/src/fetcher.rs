//! Key document fetching
//!
//! [`KeyDocumentSource`] is the seam between the scheduler and the network.
//! [`HttpKeySource`] is the production implementation; tests substitute their
//! own sources to script failures without a server.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tracing::{debug, error};

use crate::config::VerifierConfig;
use crate::error::{ConfigError, RefreshError};

/// Raw response from the key endpoint
#[derive(Debug, Clone)]
pub struct KeyDocument {
    /// HTTP status
    pub status: StatusCode,
    /// Response headers (`Age`, `Cache-Control`, ...)
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// Something that can produce the provider's key document
#[async_trait]
pub trait KeyDocumentSource: Send + Sync {
    /// Fetch the current document
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError`] when no usable response could be obtained.
    async fn fetch(&self) -> Result<KeyDocument, RefreshError>;

    /// Where documents come from, for logs
    fn describe(&self) -> &str;
}

/// Fetches the key document with a single HTTP GET
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    url: url::Url,
    client: reqwest::Client,
    max_document_size: usize,
}

impl HttpKeySource {
    /// Build a source from configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the URL is invalid or not https, or if the
    /// HTTP client cannot be created.
    pub fn new(config: &VerifierConfig) -> Result<Self, ConfigError> {
        let url = config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none()) // Don't follow redirects (security)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            url,
            client,
            max_document_size: config.max_document_size,
        })
    }

    /// The certificates URL
    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl KeyDocumentSource for HttpKeySource {
    async fn fetch(&self) -> Result<KeyDocument, RefreshError> {
        debug!(certificates_url = %self.url, "Fetching key document");

        let mut response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| {
                error!(certificates_url = %self.url, error = %e, "Failed to fetch key document");
                RefreshError::Transport(e.to_string())
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(RefreshError::Status(status));
        }

        if let Some(content_length) = response.content_length()
            && content_length > self.max_document_size as u64
        {
            return Err(RefreshError::ResponseTooLarge {
                limit: self.max_document_size,
            });
        }

        let headers = response.headers().clone();

        // Read incrementally so a lying or absent Content-Length cannot blow the limit
        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| RefreshError::Transport(format!("failed to read response: {e}")))?
        {
            if body.len() + chunk.len() > self.max_document_size {
                return Err(RefreshError::ResponseTooLarge {
                    limit: self.max_document_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(KeyDocument {
            status,
            headers,
            body: body.freeze(),
        })
    }

    fn describe(&self) -> &str {
        self.url.as_str()
    }
}
