//! HTTP backend talking to a cachebox server.

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt, TryStreamExt};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::key::ArtifactKey;

use super::{ArtifactWriter, ByteStream, StorageProvider, UploadSink};

/// Storage provider backed by a remote cachebox server.
///
/// Existence checks and fetches are retried with exponential backoff on
/// transient failures. Uploads are streamed once and never retried, since the
/// body cannot be replayed.
pub struct HttpProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
    write_buffer_chunks: usize,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Retries an operation with exponential backoff while it fails transiently.
    async fn run<F, Fut, T>(self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.delay;
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if e.kind() == ErrorKind::Transient && attempt < self.max_retries => {
                    debug!(attempt, error = %e, "retrying after transient failure");
                    attempt += 1;
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl HttpProvider {
    /// Creates a new HTTP provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        // Only connecting is bounded client-wide; bodies may stream for longer.
        // Waiting for response headers is bounded per request.
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            timeout,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                delay: Duration::from_millis(100),
            },
            write_buffer_chunks: crate::config::DEFAULT_WRITE_BUFFER_CHUNKS,
        })
    }

    pub fn with_write_buffer_chunks(mut self, chunks: usize) -> Self {
        self.write_buffer_chunks = chunks.max(1);
        self
    }

    /// Gets the URL for an artifact.
    fn artifact_url(&self, key: &ArtifactKey) -> String {
        format!("{}/v1/artifacts/{}", self.base_url, key)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Maps an unexpected response status onto the cache error taxonomy.
fn status_error(key: &ArtifactKey, status: StatusCode, detail: &str) -> Error {
    let message = if detail.is_empty() {
        format!("server responded with {}", status)
    } else {
        format!("server responded with {}: {}", status, detail)
    };

    match status {
        StatusCode::NOT_FOUND => Error::NotFound {
            key: key.to_string(),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::transient(key.as_str(), message)
        }
        s if s.is_server_error() => Error::transient(key.as_str(), message),
        _ => Error::backend(key.as_str(), message),
    }
}

fn request_error(key: &ArtifactKey, err: reqwest::Error) -> Error {
    Error::transient(key.as_str(), format!("request failed: {}", err))
}

fn timeout_error(key: &ArtifactKey, timeout: Duration) -> Error {
    Error::transient(
        key.as_str(),
        format!("no response from server within {:?}", timeout),
    )
}

/// Sends a request, bounding the wait for response headers by `timeout`.
async fn send_with_timeout(
    key: &ArtifactKey,
    request: RequestBuilder,
    timeout: Duration,
) -> Result<Response> {
    match tokio::time::timeout(timeout, request.send()).await {
        Ok(result) => result.map_err(|e| request_error(key, e)),
        Err(_) => Err(timeout_error(key, timeout)),
    }
}

async fn ensure_success(key: &ArtifactKey, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(status_error(key, status, text.trim()))
}

#[async_trait]
impl StorageProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        let url = self.artifact_url(key);

        self.retry
            .run(|| async {
                let response = self
                    .authorize(self.client.head(&url).timeout(self.timeout))
                    .send()
                    .await
                    .map_err(|e| request_error(key, e))?;

                match response.status() {
                    status if status.is_success() => Ok(true),
                    StatusCode::NOT_FOUND => Ok(false),
                    status => Err(status_error(key, status, "")),
                }
            })
            .await
    }

    fn create_read_stream(&self, key: &ArtifactKey) -> ByteStream {
        let request = self.authorize(self.client.get(self.artifact_url(key)));
        let retry = self.retry;
        let timeout = self.timeout;
        let key = key.clone();

        futures::stream::once(async move {
            let response = retry
                .run(|| async {
                    let request = request.try_clone().ok_or_else(|| {
                        Error::backend(key.as_str(), "request cannot be cloned")
                    })?;
                    let response = send_with_timeout(&key, request, timeout).await?;
                    ensure_success(&key, response).await
                })
                .await?;

            Ok::<_, Error>(
                response
                    .bytes_stream()
                    .map_err(move |e| request_error(&key, e)),
            )
        })
        .try_flatten()
        .boxed()
    }

    async fn create_write_stream(&self, key: &ArtifactKey) -> Result<ArtifactWriter> {
        let (body_tx, body_rx) = mpsc::channel::<io::Result<Bytes>>(self.write_buffer_chunks);
        let builder = self
            .authorize(self.client.put(self.artifact_url(key)))
            .body(Body::wrap_stream(body_rx));

        let request_key = key.clone();
        let request = tokio::spawn(async move {
            let response = builder
                .send()
                .await
                .map_err(|e| request_error(&request_key, e))?;
            // Only an upload can collide with another one for the same key
            if response.status() == StatusCode::CONFLICT {
                return Err(Error::UploadInProgress {
                    key: request_key.to_string(),
                });
            }
            ensure_success(&request_key, response).await?;
            Ok::<_, Error>(())
        });

        let sink = HttpSink {
            key: key.clone(),
            body: body_tx,
            request: Some(request),
            timeout: self.timeout,
        };

        Ok(ArtifactWriter::spawn(
            key.clone(),
            Box::new(sink),
            self.write_buffer_chunks,
        ))
    }
}

struct HttpSink {
    key: ArtifactKey,
    body: mpsc::Sender<io::Result<Bytes>>,
    request: Option<JoinHandle<Result<()>>>,
    /// Bound on waiting for the response once the body has ended.
    timeout: Duration,
}

impl HttpSink {
    async fn request_result(&mut self) -> Result<()> {
        let mut request = match self.request.take() {
            Some(request) => request,
            None => {
                return Err(Error::backend(
                    self.key.as_str(),
                    "upload request already settled",
                ))
            }
        };

        match tokio::time::timeout(self.timeout, &mut request).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::backend(
                self.key.as_str(),
                format!("upload request task failed: {}", e),
            )),
            Err(_) => {
                request.abort();
                Err(timeout_error(&self.key, self.timeout))
            }
        }
    }
}

#[async_trait]
impl UploadSink for HttpSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if self.body.send(Ok(chunk)).await.is_ok() {
            return Ok(());
        }

        // The server stopped reading the body; the response says why.
        self.request_result().await?;
        Err(Error::backend(
            self.key.as_str(),
            "server accepted the upload before the body was complete",
        ))
    }

    async fn complete(self: Box<Self>) -> Result<()> {
        let mut sink = *self;
        sink.body.close_channel();
        sink.request_result().await
    }

    async fn abort(self: Box<Self>) {
        let mut sink = *self;
        // An error item makes the body incomplete, so the server discards it.
        let _ = sink
            .body
            .try_send(Err(io::Error::new(io::ErrorKind::Other, "upload aborted")));
        sink.body.close_channel();
        if let Some(request) = sink.request.take() {
            request.abort();
        }
    }
}
