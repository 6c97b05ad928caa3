//! Reusable wrapper around one transport handle.
//!
//! A [`TransferHandle`] translates a [`RequestConfig`] into transport options,
//! runs the transfer (or adopts the result of a concurrent round), wraps the
//! outcome in a [`Response`] and cleans up between attempts. The underlying
//! transport handle is created lazily by the first [`TransferHandle::reset`]
//! and reused afterwards so pooled connections survive between requests.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::warn;

use crate::Result;
use crate::body::Body;
use crate::config::RequestConfig;
use crate::cookie::build_cookie_header;
use crate::error::Error;
use crate::headers::{HeaderCapture, HeaderSink};
use crate::response::{Diagnostics, Response};
use crate::retry::should_retry;
use crate::transport::{
    CompletedTransfer, MethodMarker, SharedReader, SharedWriter, TransferBody, TransferErrorKind,
    TransferInfo, Transport, TransportHandle, TransportOption,
};

const GZIP_ENCODING: &str = "gzip";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Attempt {
    error: TransferErrorKind,
    status: u16,
}

pub struct TransferHandle {
    transport: Arc<dyn Transport>,
    handle: Option<Box<dyn TransportHandle>>,
    config: RequestConfig,
    headers: Arc<HeaderCapture>,
    open_stream: Option<SharedReader>,
    destination: Option<SharedWriter>,
    last_attempt: Option<Attempt>,
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TransferHandle")
            .field("open", &self.handle.is_some())
            .field("open_stream", &self.open_stream.is_some())
            .field("destination", &self.destination.is_some())
            .field("last_attempt", &self.last_attempt)
            .finish()
    }
}

impl TransferHandle {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            handle: None,
            config: RequestConfig::new(),
            headers: Arc::new(HeaderCapture::new()),
            open_stream: None,
            destination: None,
            last_attempt: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Configuration applied by the last [`TransferHandle::apply_configuration`].
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Returns the handle to a clean state, creating the transport handle on
    /// first use (or after [`TransferHandle::close`]).
    pub fn reset(&mut self) {
        match self.handle.as_mut() {
            Some(handle) => handle.reset(),
            None => self.handle = Some(self.transport.create_handle()),
        }
        self.headers.clear();
        self.last_attempt = None;
    }

    /// Pushes every setting derived from `config` onto the transport handle.
    /// Raw transport options from the configuration are applied last.
    pub fn apply_configuration(&mut self, config: &RequestConfig) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::HandleClosed);
        };

        let url = config.build_full_url()?;
        let encoded = config.encode_body()?;
        let content_type = encoded
            .as_ref()
            .and_then(|encoded| encoded.content_type.clone())
            .or_else(|| {
                config
                    .get_content_type()
                    .map(|content_type| content_type.mime().to_owned())
            });

        let mut header_lines = Vec::with_capacity(config.get_headers().len() + 2);
        for (name, value) in config.get_headers() {
            if content_type.is_some() && name == CONTENT_TYPE {
                continue;
            }
            header_lines.push(format!(
                "{}: {}",
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
        if let Some(content_type) = &content_type {
            header_lines.push(format!("Content-Type: {content_type}"));
        }
        if let Some(token) = config.get_auth_bearer()
            && !config.get_headers().contains_key(AUTHORIZATION)
        {
            header_lines.push(format!("Authorization: Bearer {token}"));
        }

        let stored_cookies = config
            .get_cookie_jar()
            .map(|jar| jar.cookies())
            .unwrap_or_default();
        let cookie = build_cookie_header(&stored_cookies, config.get_cookies());

        let body = encoded.map(|encoded| encoded.body);
        let open_stream = match &body {
            Some(TransferBody::Reader(reader)) => Some(reader.clone()),
            _ => None,
        };

        let destination = match config.get_save_to() {
            Some(path) => {
                let file = File::create(path).map_err(|source| Error::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Some(SharedWriter::new(BufWriter::new(file)))
            }
            None => None,
        };

        let mut options = vec![
            TransportOption::Url(url),
            TransportOption::Method(MethodMarker::from_method(&config.get_method())),
            TransportOption::Headers(header_lines),
            TransportOption::Body(body),
            TransportOption::Cookie(cookie),
        ];
        if let Some(auth) = config.get_auth_basic() {
            options.push(TransportOption::BasicAuth {
                username: auth.username.clone(),
                password: auth.password.clone(),
            });
        }
        options.extend([
            TransportOption::Proxy(config.get_proxy().map(str::to_owned)),
            TransportOption::UserAgent(config.get_user_agent().map(str::to_owned)),
            TransportOption::Referer(config.get_referer().map(str::to_owned)),
            TransportOption::FollowRedirects(config.get_max_redirects() > 0),
            TransportOption::MaxRedirects(config.get_max_redirects()),
            TransportOption::Timeout(config.get_timeout()),
            TransportOption::VerifyPeer(config.get_verify_peer()),
            TransportOption::VerifyHost(config.get_verify_host()),
            TransportOption::CaFile(config.get_ca_file().map(ToOwned::to_owned)),
            TransportOption::AcceptEncoding(
                config.get_accept_gzip().then(|| GZIP_ENCODING.to_owned()),
            ),
            TransportOption::HeaderSink(Arc::clone(&self.headers) as Arc<dyn HeaderSink>),
            TransportOption::ProgressSink(config.get_on_progress().cloned()),
            TransportOption::Destination(destination.clone()),
        ]);
        options.extend(config.get_transport_options().values().cloned());

        for option in options {
            handle.set_option(option)?;
        }
        self.open_stream = open_stream;
        self.close_destination();
        self.destination = destination;
        self.config = config.clone();
        Ok(())
    }

    /// Runs the configured transfer on the calling thread.
    pub fn execute(&mut self) -> Result<Response> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::HandleClosed);
        };
        let content = handle.perform();
        Ok(self.record_attempt(content))
    }

    /// Detaches the transport handle for submission to a multi transport.
    pub fn take_handle(&mut self) -> Result<Box<dyn TransportHandle>> {
        self.handle.take().ok_or(Error::HandleClosed)
    }

    /// Adopts the result of a transfer that ran inside a concurrent round.
    ///
    /// A transfer the multi transport lost is reported with neither an error
    /// code nor a status, which the retry rules treat as retryable.
    pub fn complete(&mut self, completed: Option<CompletedTransfer>) -> Response {
        match completed {
            Some(completed) => {
                self.handle = Some(completed.handle);
                self.record_attempt(completed.content)
            }
            None => {
                self.handle = Some(self.transport.create_handle());
                let diagnostics = Diagnostics {
                    transfer: TransferInfo::default(),
                    error: TransferErrorKind::None,
                    error_message: "transfer did not complete".to_owned(),
                    method: self.config.get_method(),
                    retry_count: self.config.get_retry_count(),
                };
                self.last_attempt = Some(Attempt {
                    error: TransferErrorKind::None,
                    status: 0,
                });
                Response::from_parts(None, self.headers.snapshot(), diagnostics)
            }
        }
    }

    fn record_attempt(&mut self, content: Option<Bytes>) -> Response {
        let (transfer, error, error_message) = match self.handle.as_ref() {
            Some(handle) => (handle.info(), handle.error(), handle.error_message()),
            None => (
                TransferInfo::default(),
                TransferErrorKind::FailedInit,
                Error::HandleClosed.to_string(),
            ),
        };
        self.last_attempt = Some(Attempt {
            error,
            status: transfer.status,
        });
        let diagnostics = Diagnostics {
            transfer,
            error,
            error_message,
            method: self.config.get_method(),
            retry_count: self.config.get_retry_count(),
        };
        Response::from_parts(content, self.headers.snapshot(), diagnostics)
    }

    /// Whether the last attempt should be retried under the applied
    /// configuration's retry budget. A stream body cannot be replayed, so
    /// such requests are never retried.
    pub fn can_retry(&self) -> bool {
        let Some(attempt) = self.last_attempt else {
            return false;
        };
        if matches!(self.config.get_body(), Some(Body::Stream(_))) {
            return false;
        }
        should_retry(
            attempt.error,
            attempt.status,
            attempt.error == TransferErrorKind::Timeout,
            self.config.get_retry_count(),
            self.config.get_max_retry(),
        )
    }

    /// Post-attempt cleanup: stores `Set-Cookie` values from `response` in
    /// the configured cookie jar, then closes the request's input stream and
    /// download destination.
    pub fn finalize(&mut self, response: Option<&Response>) {
        if let Some(response) = response
            && let Some(jar) = self.config.get_cookie_jar()
            && let Some(cookies) = response.header("set-cookie")
        {
            for cookie in cookies {
                jar.add_cookie(cookie);
            }
        }
        if let Some(stream) = self.open_stream.take() {
            stream.close();
        }
        self.close_destination();
    }

    /// Releases the transport handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.handle = None;
        if let Some(stream) = self.open_stream.take() {
            stream.close();
        }
        self.close_destination();
    }

    fn close_destination(&mut self) {
        if let Some(destination) = self.destination.take()
            && let Err(error) = destination.close()
        {
            warn!(error = %error, "failed to flush download destination");
        }
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.close();
    }
}
