//! Interface of the transport primitive that performs network I/O.
//!
//! A [`Transport`] creates reusable [`TransportHandle`]s and a
//! [`MultiTransport`] that runs several handles at once. Handles are configured
//! one [`TransportOption`] at a time, performed, inspected, and reset for reuse.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::Result;
use crate::headers::HeaderSink;
use crate::multi::ThreadMulti;
use crate::util::lock_unpoisoned;

/// Failure category of one transfer, carried as data on the response.
///
/// Numeric codes follow curl's numbering where an equivalent exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferErrorKind {
    #[default]
    None,
    UnsupportedProtocol,
    FailedInit,
    UrlMalformat,
    Proxy,
    Dns,
    Connect,
    Timeout,
    Tls,
    Write,
    TooManyRedirects,
    Send,
    Receive,
    Other,
}

impl TransferErrorKind {
    pub const fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::UnsupportedProtocol => 1,
            Self::FailedInit => 2,
            Self::UrlMalformat => 3,
            Self::Proxy => 5,
            Self::Dns => 6,
            Self::Connect => 7,
            Self::Timeout => 28,
            Self::Write => 23,
            Self::Tls => 35,
            Self::TooManyRedirects => 47,
            Self::Send => 55,
            Self::Receive => 56,
            Self::Other => 99,
        }
    }

    pub const fn is_none(self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::None => "none",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::FailedInit => "failed_init",
            Self::UrlMalformat => "url_malformat",
            Self::Proxy => "proxy",
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::Write => "write",
            Self::TooManyRedirects => "too_many_redirects",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Diagnostics reported by a handle after a transfer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransferInfo {
    pub status: u16,
    pub effective_url: String,
    pub redirect_count: u32,
    pub total_time: Duration,
    pub size_download: u64,
    pub size_upload: u64,
    pub content_type: Option<String>,
    pub download_content_length: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub download_total: u64,
    pub downloaded: u64,
    pub upload_total: u64,
    pub uploaded: u64,
}

/// Receives transfer progress reports.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TransferProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(TransferProgress) + Send + Sync,
{
    fn on_progress(&self, progress: TransferProgress) {
        self(progress)
    }
}

/// An input stream shared between a configuration and the handle sending it.
///
/// Closing drops the underlying reader; later reads see end of stream.
#[derive(Clone)]
pub struct SharedReader {
    inner: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
}

impl SharedReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(reader)))),
        }
    }

    pub fn close(&self) {
        lock_unpoisoned(&self.inner).take();
    }

    pub fn is_open(&self) -> bool {
        lock_unpoisoned(&self.inner).is_some()
    }
}

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match lock_unpoisoned(&self.inner).as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl fmt::Debug for SharedReader {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SharedReader")
            .field("open", &self.is_open())
            .finish()
    }
}

/// Destination a transport writes response body chunks into as they arrive.
///
/// Closing flushes and drops the underlying writer; later writes fail.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl SharedWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    pub fn close(&self) -> io::Result<()> {
        match lock_unpoisoned(&self.inner).take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        lock_unpoisoned(&self.inner).is_some()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match lock_unpoisoned(&self.inner).as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "download destination is closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock_unpoisoned(&self.inner).as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SharedWriter")
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum TransferBody {
    Bytes(Bytes),
    Reader(SharedReader),
}

/// Method marker: GET, POST and HEAD are dedicated; everything else is custom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodMarker {
    Get,
    Post,
    Head,
    Custom(String),
}

impl MethodMarker {
    pub fn from_method(method: &http::Method) -> Self {
        match *method {
            http::Method::GET => Self::Get,
            http::Method::POST => Self::Post,
            http::Method::HEAD => Self::Head,
            ref other => Self::Custom(other.as_str().to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
            Self::Custom(method) => method,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportOptionKey {
    Url,
    Method,
    Headers,
    Body,
    Cookie,
    BasicAuth,
    Proxy,
    UserAgent,
    Referer,
    FollowRedirects,
    MaxRedirects,
    Timeout,
    VerifyPeer,
    VerifyHost,
    CaFile,
    AcceptEncoding,
    HeaderSink,
    ProgressSink,
    Destination,
}

impl TransportOptionKey {
    pub const ALL: [Self; 19] = [
        Self::Url,
        Self::Method,
        Self::Headers,
        Self::Body,
        Self::Cookie,
        Self::BasicAuth,
        Self::Proxy,
        Self::UserAgent,
        Self::Referer,
        Self::FollowRedirects,
        Self::MaxRedirects,
        Self::Timeout,
        Self::VerifyPeer,
        Self::VerifyHost,
        Self::CaFile,
        Self::AcceptEncoding,
        Self::HeaderSink,
        Self::ProgressSink,
        Self::Destination,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Method => "method",
            Self::Headers => "headers",
            Self::Body => "body",
            Self::Cookie => "cookie",
            Self::BasicAuth => "basic_auth",
            Self::Proxy => "proxy",
            Self::UserAgent => "user_agent",
            Self::Referer => "referer",
            Self::FollowRedirects => "follow_redirects",
            Self::MaxRedirects => "max_redirects",
            Self::Timeout => "timeout",
            Self::VerifyPeer => "verify_peer",
            Self::VerifyHost => "verify_host",
            Self::CaFile => "ca_file",
            Self::AcceptEncoding => "accept_encoding",
            Self::HeaderSink => "header_sink",
            Self::ProgressSink => "progress_sink",
            Self::Destination => "destination",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(name))
    }
}

/// One setting pushed onto a [`TransportHandle`].
#[derive(Clone)]
pub enum TransportOption {
    Url(String),
    Method(MethodMarker),
    /// Complete `Name: value` request header lines.
    Headers(Vec<String>),
    Body(Option<TransferBody>),
    Cookie(Option<String>),
    BasicAuth { username: String, password: String },
    Proxy(Option<String>),
    UserAgent(Option<String>),
    Referer(Option<String>),
    FollowRedirects(bool),
    MaxRedirects(u32),
    /// `Duration::ZERO` disables the timeout.
    Timeout(Duration),
    VerifyPeer(bool),
    VerifyHost(bool),
    CaFile(Option<PathBuf>),
    AcceptEncoding(Option<String>),
    HeaderSink(Arc<dyn HeaderSink>),
    ProgressSink(Option<Arc<dyn ProgressSink>>),
    /// Body chunks go here instead of the returned content.
    Destination(Option<SharedWriter>),
}

impl TransportOption {
    pub fn key(&self) -> TransportOptionKey {
        match self {
            Self::Url(_) => TransportOptionKey::Url,
            Self::Method(_) => TransportOptionKey::Method,
            Self::Headers(_) => TransportOptionKey::Headers,
            Self::Body(_) => TransportOptionKey::Body,
            Self::Cookie(_) => TransportOptionKey::Cookie,
            Self::BasicAuth { .. } => TransportOptionKey::BasicAuth,
            Self::Proxy(_) => TransportOptionKey::Proxy,
            Self::UserAgent(_) => TransportOptionKey::UserAgent,
            Self::Referer(_) => TransportOptionKey::Referer,
            Self::FollowRedirects(_) => TransportOptionKey::FollowRedirects,
            Self::MaxRedirects(_) => TransportOptionKey::MaxRedirects,
            Self::Timeout(_) => TransportOptionKey::Timeout,
            Self::VerifyPeer(_) => TransportOptionKey::VerifyPeer,
            Self::VerifyHost(_) => TransportOptionKey::VerifyHost,
            Self::CaFile(_) => TransportOptionKey::CaFile,
            Self::AcceptEncoding(_) => TransportOptionKey::AcceptEncoding,
            Self::HeaderSink(_) => TransportOptionKey::HeaderSink,
            Self::ProgressSink(_) => TransportOptionKey::ProgressSink,
            Self::Destination(_) => TransportOptionKey::Destination,
        }
    }

    /// Builds an option from its name and a JSON value. Sinks and
    /// destinations hold live objects and cannot be expressed this way.
    pub fn from_json(key: TransportOptionKey, value: &Value) -> std::result::Result<Self, String> {
        let option = match key {
            TransportOptionKey::Url => Self::Url(json_string(value)?),
            TransportOptionKey::Method => {
                let method = json_string(value)?;
                let method = http::Method::from_bytes(method.as_bytes())
                    .map_err(|_| format!("invalid method {method}"))?;
                Self::Method(MethodMarker::from_method(&method))
            }
            TransportOptionKey::Headers => {
                let lines = value
                    .as_array()
                    .ok_or_else(|| "expected an array of header lines".to_owned())?
                    .iter()
                    .map(json_string)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Self::Headers(lines)
            }
            TransportOptionKey::Body => match value {
                Value::Null => Self::Body(None),
                Value::String(text) => {
                    Self::Body(Some(TransferBody::Bytes(Bytes::from(text.clone()))))
                }
                _ => return Err("expected a string body or null".to_owned()),
            },
            TransportOptionKey::Cookie => Self::Cookie(json_optional_string(value)?),
            TransportOptionKey::BasicAuth => {
                let (username, password) = json_string_pair(value)?;
                Self::BasicAuth { username, password }
            }
            TransportOptionKey::Proxy => Self::Proxy(json_optional_string(value)?),
            TransportOptionKey::UserAgent => Self::UserAgent(json_optional_string(value)?),
            TransportOptionKey::Referer => Self::Referer(json_optional_string(value)?),
            TransportOptionKey::FollowRedirects => Self::FollowRedirects(json_bool(value)?),
            TransportOptionKey::MaxRedirects => {
                let max = json_u64(value)?;
                Self::MaxRedirects(u32::try_from(max).map_err(|_| "value too large".to_owned())?)
            }
            TransportOptionKey::Timeout => Self::Timeout(json_duration(value)?),
            TransportOptionKey::VerifyPeer => Self::VerifyPeer(json_bool(value)?),
            TransportOptionKey::VerifyHost => Self::VerifyHost(json_bool(value)?),
            TransportOptionKey::CaFile => {
                Self::CaFile(json_optional_string(value)?.map(PathBuf::from))
            }
            TransportOptionKey::AcceptEncoding => {
                Self::AcceptEncoding(json_optional_string(value)?)
            }
            TransportOptionKey::HeaderSink
            | TransportOptionKey::ProgressSink
            | TransportOptionKey::Destination => {
                return Err(format!("{} cannot be set from a plain value", key.as_str()));
            }
        };
        Ok(option)
    }
}

impl fmt::Debug for TransportOption {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => formatter.debug_tuple("Url").field(url).finish(),
            Self::Method(method) => formatter.debug_tuple("Method").field(method).finish(),
            Self::Headers(lines) => formatter.debug_tuple("Headers").field(lines).finish(),
            Self::Body(body) => formatter.debug_tuple("Body").field(body).finish(),
            Self::Cookie(cookie) => formatter.debug_tuple("Cookie").field(cookie).finish(),
            Self::BasicAuth { username, .. } => formatter
                .debug_struct("BasicAuth")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Proxy(proxy) => formatter.debug_tuple("Proxy").field(proxy).finish(),
            Self::UserAgent(agent) => formatter.debug_tuple("UserAgent").field(agent).finish(),
            Self::Referer(referer) => formatter.debug_tuple("Referer").field(referer).finish(),
            Self::FollowRedirects(follow) => formatter
                .debug_tuple("FollowRedirects")
                .field(follow)
                .finish(),
            Self::MaxRedirects(max) => formatter.debug_tuple("MaxRedirects").field(max).finish(),
            Self::Timeout(timeout) => formatter.debug_tuple("Timeout").field(timeout).finish(),
            Self::VerifyPeer(verify) => formatter.debug_tuple("VerifyPeer").field(verify).finish(),
            Self::VerifyHost(verify) => formatter.debug_tuple("VerifyHost").field(verify).finish(),
            Self::CaFile(path) => formatter.debug_tuple("CaFile").field(path).finish(),
            Self::AcceptEncoding(encoding) => formatter
                .debug_tuple("AcceptEncoding")
                .field(encoding)
                .finish(),
            Self::HeaderSink(_) => formatter.write_str("HeaderSink(..)"),
            Self::ProgressSink(sink) => formatter
                .debug_tuple("ProgressSink")
                .field(&sink.is_some())
                .finish(),
            Self::Destination(destination) => formatter
                .debug_tuple("Destination")
                .field(destination)
                .finish(),
        }
    }
}

fn json_string(value: &Value) -> std::result::Result<String, String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| "expected a string".to_owned())
}

fn json_optional_string(value: &Value) -> std::result::Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        other => json_string(other).map(Some),
    }
}

fn json_bool(value: &Value) -> std::result::Result<bool, String> {
    value.as_bool().ok_or_else(|| "expected a boolean".to_owned())
}

pub(crate) fn json_u64(value: &Value) -> std::result::Result<u64, String> {
    match value.as_i64() {
        Some(number) if number < 0 => Err("must not be negative".to_owned()),
        Some(number) => Ok(number as u64),
        None => value
            .as_u64()
            .ok_or_else(|| "expected a non-negative integer".to_owned()),
    }
}

/// Seconds, integral or fractional.
pub(crate) fn json_duration(value: &Value) -> std::result::Result<Duration, String> {
    let seconds = value
        .as_f64()
        .ok_or_else(|| "expected a number of seconds".to_owned())?;
    if seconds < 0.0 {
        return Err("must not be negative".to_owned());
    }
    Duration::try_from_secs_f64(seconds).map_err(|error| error.to_string())
}

pub(crate) fn json_string_pair(value: &Value) -> std::result::Result<(String, String), String> {
    match value.as_array().map(Vec::as_slice) {
        Some([username, password]) => Ok((json_string(username)?, json_string(password)?)),
        _ => Err("expected exactly [username, password]".to_owned()),
    }
}

/// One reusable transfer handle.
pub trait TransportHandle: Send {
    /// Clears per-request state while keeping the handle (and any pooled
    /// connections) alive.
    fn reset(&mut self);

    fn set_option(&mut self, option: TransportOption) -> Result<()>;

    /// Runs the transfer. `None` signals a failed transfer; details are
    /// available from [`TransportHandle::error`].
    fn perform(&mut self) -> Option<Bytes>;

    fn info(&self) -> TransferInfo;

    fn error(&self) -> TransferErrorKind;

    fn error_message(&self) -> String;
}

/// A handle returned by [`MultiTransport::remove`] together with the content
/// its transfer produced.
pub struct CompletedTransfer {
    pub handle: Box<dyn TransportHandle>,
    pub content: Option<Bytes>,
}

impl fmt::Debug for CompletedTransfer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CompletedTransfer")
            .field("error", &self.handle.error())
            .field("content_len", &self.content.as_ref().map(Bytes::len))
            .finish()
    }
}

/// Runs several handles concurrently.
pub trait MultiTransport: Send {
    fn add(&mut self, token: usize, handle: Box<dyn TransportHandle>);

    /// Advances transfers and returns how many are still running.
    fn perform(&mut self) -> usize;

    /// Waits up to `timeout` for activity.
    fn poll(&mut self, timeout: Duration) -> io::Result<()>;

    /// Detaches a finished handle. Returns `None` for unknown tokens and for
    /// transfers still running.
    fn remove(&mut self, token: usize) -> Option<CompletedTransfer>;
}

/// Factory for transport handles.
pub trait Transport: Send + Sync {
    fn create_handle(&self) -> Box<dyn TransportHandle>;

    fn create_multi(&self) -> Box<dyn MultiTransport> {
        Box::new(ThreadMulti::new())
    }
}
