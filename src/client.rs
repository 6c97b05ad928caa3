use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Method;
use serde_json::Value;
use tracing::{debug, info_span, warn};

use crate::Result;
use crate::batch::{BatchScheduler, DEFAULT_CONCURRENCY};
use crate::config::RequestConfig;
use crate::cookie::CookieStore;
use crate::error::Error;
use crate::handle::TransferHandle;
use crate::response::Response;
use crate::transport::Transport;
use crate::ureq_transport::UreqTransport;
use crate::util::{lock_unpoisoned, redact_url_for_logs};

/// Entry point for standalone requests, downloads and batches.
///
/// Standalone requests share one reusable handle and therefore run one at a
/// time per client; batches get their own handle pool.
pub struct Client {
    transport: Arc<dyn Transport>,
    defaults: RequestConfig,
    standalone: Mutex<TransferHandle>,
    concurrency: usize,
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Client")
            .field("defaults", &self.defaults)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    defaults: RequestConfig,
    concurrency: usize,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("custom_transport", &self.transport.is_some())
            .field("defaults", &self.defaults)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            defaults: RequestConfig::defaults(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        self.transport = Some(transport);
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Layers `config` over the current defaults.
    pub fn defaults(mut self, config: RequestConfig) -> Self {
        self.defaults = RequestConfig::merge(&self.defaults, &config);
        self
    }

    /// Layers a JSON options object over the current defaults.
    pub fn options(self, options: &Value) -> Result<Self> {
        let config = RequestConfig::from_options(options)?;
        Ok(self.defaults(config))
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.defaults = self.defaults.base_url(base_url);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.defaults = self.defaults.timeout(timeout);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.defaults = self.defaults.max_retry(max_retry);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.defaults = self.defaults.user_agent(user_agent);
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieStore>) -> Self {
        self.defaults = self.defaults.cookie_jar(jar);
        self
    }

    pub fn try_default_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.defaults = self.defaults.try_header(name, value)?;
        Ok(self)
    }

    /// Batch window size. Values below 1 are raised to 1.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn build(self) -> Client {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(UreqTransport::new()),
        };
        Client {
            standalone: Mutex::new(TransferHandle::new(Arc::clone(&transport))),
            transport,
            defaults: self.defaults,
            concurrency: self.concurrency,
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn defaults(&self) -> &RequestConfig {
        &self.defaults
    }

    /// Sends one request, retrying on the calling thread while the retry
    /// rules allow it. The last attempt's response is returned as is;
    /// transport failures are reported on it rather than as errors.
    pub fn request(
        &self,
        method: Method,
        url: impl Into<String>,
        overrides: RequestConfig,
    ) -> Result<Response> {
        let config = RequestConfig::merge(&self.defaults, &overrides.method(method).url(url));
        self.send(config)
    }

    /// Sends a fully built configuration, layered over the client defaults.
    pub fn execute(&self, config: RequestConfig) -> Result<Response> {
        self.send(RequestConfig::merge(&self.defaults, &config))
    }

    fn send(&self, mut config: RequestConfig) -> Result<Response> {
        let redacted_url = redact_url_for_logs(&config.build_full_url()?);
        let mut handle = lock_unpoisoned(&self.standalone);

        loop {
            let span = info_span!(
                "reqpool.request",
                method = %config.get_method(),
                url = %redacted_url,
                retry_count = config.get_retry_count(),
                max_retry = config.get_max_retry()
            );
            let _enter = span.enter();

            handle.reset();
            handle.apply_configuration(&config)?;
            debug!("sending request");
            let response = handle.execute()?;
            if !handle.can_retry() {
                handle.finalize(Some(&response));
                return Ok(response);
            }

            handle.finalize(None);
            let retry_count = config.advance_retry();
            warn!(
                status = response.status_code(),
                error = %response.error_code(),
                retry_count = retry_count,
                timeout_ms = config.get_timeout().as_millis() as u64,
                "retrying request"
            );
        }
    }

    pub fn get(&self, url: impl Into<String>, overrides: RequestConfig) -> Result<Response> {
        self.request(Method::GET, url, overrides)
    }

    pub fn post(&self, url: impl Into<String>, overrides: RequestConfig) -> Result<Response> {
        self.request(Method::POST, url, overrides)
    }

    pub fn put(&self, url: impl Into<String>, overrides: RequestConfig) -> Result<Response> {
        self.request(Method::PUT, url, overrides)
    }

    pub fn patch(&self, url: impl Into<String>, overrides: RequestConfig) -> Result<Response> {
        self.request(Method::PATCH, url, overrides)
    }

    pub fn delete(&self, url: impl Into<String>, overrides: RequestConfig) -> Result<Response> {
        self.request(Method::DELETE, url, overrides)
    }

    pub fn head(&self, url: impl Into<String>, overrides: RequestConfig) -> Result<Response> {
        self.request(Method::HEAD, url, overrides)
    }

    /// Fetches `url`, streaming the decoded content into `destination` as it
    /// arrives. The returned response carries the written bytes as plain
    /// content. When the transfer fails the partial file is removed.
    pub fn download(
        &self,
        url: impl Into<String>,
        destination: impl AsRef<Path>,
        overrides: RequestConfig,
    ) -> Result<Response> {
        let destination = destination.as_ref();
        let mut response = self.get(url, overrides.save_to(destination))?;
        if response.is_failure() {
            if let Err(error) = std::fs::remove_file(destination) {
                debug!(
                    path = %destination.display(),
                    error = %error,
                    "partial download not removed"
                );
            }
            return Ok(response);
        }
        let content = std::fs::read(destination).map_err(|source| Error::Io {
            path: destination.to_path_buf(),
            source,
        })?;
        debug!(
            path = %destination.display(),
            bytes = content.len(),
            "download written"
        );
        response.set_content(content, false);
        Ok(response)
    }

    /// New batch scheduler sharing this client's transport and defaults.
    pub fn batch(&self) -> BatchScheduler {
        BatchScheduler::new(Arc::clone(&self.transport), self.defaults.clone())
            .with_concurrency(self.concurrency)
    }
}
