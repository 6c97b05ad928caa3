//! Blocking transport backed by `ureq`.
//!
//! Redirects are followed here rather than by `ureq`, so every hop's status
//! line and headers reach the header sink and `Set-Cookie` values from
//! intermediate responses are not lost.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use bytes::Bytes;
use http::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, REFERER,
    USER_AGENT,
};
use http::{HeaderName, HeaderValue, Method};
use tracing::debug;

use crate::Result;
use crate::content_encoding::{declares_gzip, gzip_reader};
use crate::error::Error;
use crate::headers::HeaderSink;
use crate::transport::{
    MethodMarker, ProgressSink, SharedWriter, TransferBody, TransferErrorKind, TransferInfo,
    TransferProgress, Transport, TransportHandle, TransportOption,
};
use crate::util::{
    lock_unpoisoned, redact_url_for_logs, same_origin, sanitize_headers_for_redirect,
};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Creates [`UreqHandle`]s that share agents (and their connection pools)
/// per TLS and proxy setup.
#[derive(Clone, Default)]
pub struct UreqTransport {
    agents: Arc<AgentCache>,
}

impl UreqTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for UreqTransport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("UreqTransport")
            .field("agents", &lock_unpoisoned(&self.agents.agents).len())
            .finish()
    }
}

impl Transport for UreqTransport {
    fn create_handle(&self) -> Box<dyn TransportHandle> {
        Box::new(UreqHandle::new(Arc::clone(&self.agents)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AgentKey {
    verify: bool,
    ca_file: Option<PathBuf>,
    proxy: Option<String>,
}

#[derive(Default)]
struct AgentCache {
    agents: Mutex<HashMap<AgentKey, ureq::Agent>>,
}

impl AgentCache {
    fn agent(&self, key: AgentKey) -> std::result::Result<ureq::Agent, Failure> {
        let mut agents = lock_unpoisoned(&self.agents);
        if let Some(agent) = agents.get(&key) {
            return Ok(agent.clone());
        }
        let agent = make_agent(&key)?;
        agents.insert(key, agent.clone());
        Ok(agent)
    }
}

fn make_agent(key: &AgentKey) -> std::result::Result<ureq::Agent, Failure> {
    let proxy = match &key.proxy {
        Some(proxy) => Some(ureq::Proxy::new(proxy).map_err(|error| {
            Failure::new(TransferErrorKind::Proxy, format!("invalid proxy {proxy}: {error}"))
        })?),
        None => None,
    };
    let config = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .max_redirects(0)
        .tls_config(build_tls_config(key)?)
        .proxy(proxy)
        .build();
    Ok(config.new_agent())
}

fn build_tls_config(key: &AgentKey) -> std::result::Result<ureq::tls::TlsConfig, Failure> {
    let mut builder = ureq::tls::TlsConfig::builder();
    #[cfg(all(feature = "tls-native", not(feature = "tls-rustls")))]
    {
        builder = builder.provider(ureq::tls::TlsProvider::NativeTls);
    }
    if !key.verify {
        builder = builder.disable_verification(true);
    }
    if let Some(path) = &key.ca_file {
        let pem = std::fs::read(path).map_err(|error| {
            Failure::new(
                TransferErrorKind::Tls,
                format!("failed to read ca file {}: {error}", path.display()),
            )
        })?;
        let mut certificates = Vec::new();
        for item in ureq::tls::parse_pem(&pem) {
            let item = item.map_err(|error| {
                Failure::new(
                    TransferErrorKind::Tls,
                    format!("failed to parse ca file {}: {error}", path.display()),
                )
            })?;
            if let ureq::tls::PemItem::Certificate(certificate) = item {
                certificates.push(certificate);
            }
        }
        if certificates.is_empty() {
            return Err(Failure::new(
                TransferErrorKind::Tls,
                format!("no certificate blocks found in {}", path.display()),
            ));
        }
        builder = builder.root_certs(ureq::tls::RootCerts::new_with_certs(&certificates));
    }
    Ok(builder.build())
}

#[derive(Debug)]
struct Failure {
    kind: TransferErrorKind,
    message: String,
}

impl Failure {
    fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_ureq(error: &ureq::Error) -> Self {
        Self::new(classify_ureq_error(error), error.to_string())
    }

    fn from_io(error: &std::io::Error) -> Self {
        if let Some(ureq_error) = wrapped_ureq_error(error) {
            return Self::from_ureq(ureq_error);
        }
        let kind = match error.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransferErrorKind::Timeout
            }
            _ => TransferErrorKind::Receive,
        };
        Self::new(kind, error.to_string())
    }
}

fn classify_ureq_error(error: &ureq::Error) -> TransferErrorKind {
    match error {
        ureq::Error::Timeout(_) => TransferErrorKind::Timeout,
        ureq::Error::BadUri(_) => TransferErrorKind::UrlMalformat,
        ureq::Error::TooManyRedirects => TransferErrorKind::TooManyRedirects,
        ureq::Error::HostNotFound => TransferErrorKind::Dns,
        ureq::Error::InvalidProxyUrl => TransferErrorKind::Proxy,
        ureq::Error::ConnectProxyFailed(_) | ureq::Error::ConnectionFailed => {
            TransferErrorKind::Connect
        }
        ureq::Error::Tls(_) => TransferErrorKind::Tls,
        #[cfg(feature = "tls-rustls")]
        ureq::Error::Rustls(_) => TransferErrorKind::Tls,
        #[cfg(feature = "tls-native")]
        ureq::Error::NativeTls(_) => TransferErrorKind::Tls,
        #[cfg(feature = "tls-native")]
        ureq::Error::Der(_) => TransferErrorKind::Tls,
        #[cfg(any(feature = "tls-rustls", feature = "tls-native"))]
        ureq::Error::Pem(_) => TransferErrorKind::Tls,
        ureq::Error::Io(source) => match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransferErrorKind::Timeout
            }
            std::io::ErrorKind::NotFound => TransferErrorKind::Dns,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::AddrNotAvailable => TransferErrorKind::Connect,
            std::io::ErrorKind::BrokenPipe => TransferErrorKind::Send,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof => {
                TransferErrorKind::Receive
            }
            _ => TransferErrorKind::Other,
        },
        _ => TransferErrorKind::Other,
    }
}

fn wrapped_ureq_error(io_error: &std::io::Error) -> Option<&ureq::Error> {
    io_error
        .get_ref()
        .and_then(|source| source.downcast_ref::<ureq::Error>())
}

/// Per-request settings accumulated through [`TransportHandle::set_option`].
#[derive(Clone)]
struct RequestState {
    url: Option<String>,
    method: MethodMarker,
    headers: Vec<String>,
    body: Option<TransferBody>,
    cookie: Option<String>,
    basic_auth: Option<(String, String)>,
    proxy: Option<String>,
    user_agent: Option<String>,
    referer: Option<String>,
    follow_redirects: bool,
    max_redirects: u32,
    timeout: Duration,
    verify_peer: bool,
    verify_host: bool,
    ca_file: Option<PathBuf>,
    accept_encoding: Option<String>,
    header_sink: Option<Arc<dyn HeaderSink>>,
    progress_sink: Option<Arc<dyn ProgressSink>>,
    destination: Option<SharedWriter>,
}

impl Default for RequestState {
    fn default() -> Self {
        Self {
            url: None,
            method: MethodMarker::Get,
            headers: Vec::new(),
            body: None,
            cookie: None,
            basic_auth: None,
            proxy: None,
            user_agent: None,
            referer: None,
            follow_redirects: true,
            max_redirects: 5,
            timeout: Duration::ZERO,
            verify_peer: true,
            verify_host: true,
            ca_file: None,
            accept_encoding: None,
            header_sink: None,
            progress_sink: None,
            destination: None,
        }
    }
}

impl RequestState {
    fn agent_key(&self) -> AgentKey {
        AgentKey {
            verify: self.verify_peer && self.verify_host,
            ca_file: self.ca_file.clone(),
            proxy: self.proxy.clone(),
        }
    }

    fn http_method(&self) -> std::result::Result<Method, Failure> {
        Method::from_bytes(self.method.as_str().as_bytes()).map_err(|_| {
            Failure::new(
                TransferErrorKind::FailedInit,
                format!("invalid request method {}", self.method.as_str()),
            )
        })
    }

    fn request_headers(&self) -> std::result::Result<Vec<(HeaderName, HeaderValue)>, Failure> {
        let invalid = |line: &str| {
            Failure::new(
                TransferErrorKind::FailedInit,
                format!("invalid request header {line:?}"),
            )
        };
        let mut headers = Vec::with_capacity(self.headers.len() + 5);
        for line in &self.headers {
            let (name, value) = line.split_once(':').ok_or_else(|| invalid(line))?;
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid(line))?;
            let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid(line))?;
            headers.push((name, value));
        }

        let mut add_default = |name: HeaderName, value: String| {
            if headers.iter().any(|(existing, _)| *existing == name) {
                return Ok(());
            }
            let value = HeaderValue::from_str(&value).map_err(|_| invalid(name.as_str()))?;
            headers.push((name, value));
            Ok(())
        };
        if let Some(cookie) = &self.cookie {
            add_default(COOKIE, cookie.clone())?;
        }
        if let Some((username, password)) = &self.basic_auth {
            let credentials =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            add_default(AUTHORIZATION, format!("Basic {credentials}"))?;
        }
        if let Some(user_agent) = &self.user_agent {
            add_default(USER_AGENT, user_agent.clone())?;
        }
        if let Some(referer) = &self.referer {
            add_default(REFERER, referer.clone())?;
        }
        if let Some(accept_encoding) = &self.accept_encoding {
            add_default(ACCEPT_ENCODING, accept_encoding.clone())?;
        }
        Ok(headers)
    }
}

/// One reusable `ureq` transfer.
pub struct UreqHandle {
    agents: Arc<AgentCache>,
    request: RequestState,
    info: TransferInfo,
    error: TransferErrorKind,
    error_message: String,
}

impl UreqHandle {
    fn new(agents: Arc<AgentCache>) -> Self {
        Self {
            agents,
            request: RequestState::default(),
            info: TransferInfo::default(),
            error: TransferErrorKind::None,
            error_message: String::new(),
        }
    }

    fn run(&mut self, started: Instant) -> std::result::Result<Bytes, Failure> {
        let Some(url) = self.request.url.clone() else {
            return Err(Failure::new(TransferErrorKind::UrlMalformat, "no url set"));
        };
        let mut current = parse_target(&url)?;
        let agent = self.agents.agent(self.request.agent_key())?;
        let mut headers = self.request.request_headers()?;
        let mut method = self.request.http_method()?;
        let mut body = self.request.body.clone();
        let deadline = (!self.request.timeout.is_zero()).then(|| started + self.request.timeout);
        self.info.effective_url = current.to_string();

        loop {
            let timeout = remaining_timeout(deadline)?;
            debug!(
                method = %method,
                url = %redact_url_for_logs(current.as_str()),
                redirects = self.info.redirect_count,
                "sending transfer"
            );
            let mut response = self.send(
                &agent,
                &method,
                current.as_str(),
                &headers,
                body.clone(),
                timeout,
            )?;
            self.emit_headers(&response);

            let status = response.status().as_u16();
            self.info.status = status;
            self.info.effective_url = current.to_string();

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            if self.request.follow_redirects
                && is_redirect(status)
                && let Some(location) = location
            {
                if self.info.redirect_count >= self.request.max_redirects {
                    return Err(Failure::new(
                        TransferErrorKind::TooManyRedirects,
                        format!(
                            "maximum ({}) redirects followed",
                            self.request.max_redirects
                        ),
                    ));
                }
                let next = current.join(&location).map_err(|error| {
                    Failure::new(
                        TransferErrorKind::UrlMalformat,
                        format!("invalid redirect location {location}: {error}"),
                    )
                })?;
                let next_method = redirect_method(&method, status);
                let method_changed_to_get = next_method == Method::GET && method != Method::GET;
                sanitize_headers_for_redirect(
                    &mut headers,
                    method_changed_to_get,
                    same_origin(&current, &next),
                );
                if method_changed_to_get {
                    body = None;
                }
                if matches!(body, Some(TransferBody::Reader(_)))
                    && next_method != Method::GET
                    && next_method != Method::HEAD
                {
                    return Err(Failure::new(
                        TransferErrorKind::Send,
                        format!(
                            "cannot resend a streamed request body after a {status} redirect"
                        ),
                    ));
                }
                self.info.redirect_count += 1;
                method = next_method;
                current = next;
                continue;
            }

            return self.read_body(&mut response);
        }
    }

    fn send(
        &mut self,
        agent: &ureq::Agent,
        method: &Method,
        url: &str,
        headers: &[(HeaderName, HeaderValue)],
        body: Option<TransferBody>,
        timeout: Option<Duration>,
    ) -> std::result::Result<ureq::http::Response<ureq::Body>, Failure> {
        let mut builder = ureq::http::Request::builder().method(method.clone()).uri(url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let build_failure =
            |error: http::Error| Failure::new(TransferErrorKind::UrlMalformat, error.to_string());

        let body = body.filter(|_| *method != Method::GET && *method != Method::HEAD);
        match body {
            None => {
                let request = builder.body(()).map_err(build_failure)?;
                run_configured_request(agent, request, timeout)
            }
            Some(TransferBody::Bytes(bytes)) => {
                self.info.size_upload = bytes.len() as u64;
                let request = builder.body(bytes.to_vec()).map_err(build_failure)?;
                run_configured_request(agent, request, timeout)
            }
            Some(TransferBody::Reader(reader)) => {
                let request = builder
                    .body(ureq::SendBody::from_owned_reader(reader))
                    .map_err(build_failure)?;
                run_configured_request(agent, request, timeout)
            }
        }
    }

    fn emit_headers(&self, response: &ureq::http::Response<ureq::Body>) {
        let Some(sink) = &self.request.header_sink else {
            return;
        };
        let status = response.status();
        sink.on_header_line(&format!(
            "{:?} {} {}",
            response.version(),
            status.as_u16(),
            status.canonical_reason().unwrap_or_default()
        ));
        for (name, value) in response.headers() {
            sink.on_header_line(&format!(
                "{}: {}",
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
    }

    fn read_body(
        &mut self,
        response: &mut ureq::http::Response<ureq::Body>,
    ) -> std::result::Result<Bytes, Failure> {
        let headers = response.headers();
        self.info.content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        self.info.download_content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        let gzip_encoded = self.request.accept_encoding.is_some()
            && headers
                .get_all(http::header::CONTENT_ENCODING)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(declares_gzip);

        let progress_sink = self.request.progress_sink.clone();
        let download_total = self.info.download_content_length.unwrap_or(0);
        let uploaded = self.info.size_upload;
        let mut destination = self.request.destination.clone();
        let raw_reader = response.body_mut().as_reader();
        // A destination receives decoded bytes; in-memory content stays raw
        // and is decoded when the response is read.
        let mut reader: Box<dyn Read + '_> = match &destination {
            Some(_) if gzip_encoded => gzip_reader(raw_reader),
            _ => Box::new(raw_reader),
        };
        let mut collected = Vec::new();
        let mut received = 0_u64;
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            let read = reader
                .read(&mut chunk)
                .map_err(|error| Failure::from_io(&error))?;
            if read == 0 {
                break;
            }
            received += read as u64;
            match destination.as_mut() {
                Some(writer) => writer.write_all(&chunk[..read]).map_err(|error| {
                    Failure::new(
                        TransferErrorKind::Write,
                        format!("failed writing body to destination: {error}"),
                    )
                })?,
                None => collected.extend_from_slice(&chunk[..read]),
            }
            if let Some(sink) = &progress_sink {
                sink.on_progress(TransferProgress {
                    download_total,
                    downloaded: received,
                    upload_total: uploaded,
                    uploaded,
                });
            }
        }
        if let Some(writer) = destination.as_mut() {
            writer.flush().map_err(|error| {
                Failure::new(
                    TransferErrorKind::Write,
                    format!("failed flushing destination: {error}"),
                )
            })?;
        }
        self.info.size_download = received;
        Ok(Bytes::from(collected))
    }
}

impl fmt::Debug for UreqHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("UreqHandle")
            .field("url", &self.request.url.as_deref().map(redact_url_for_logs))
            .field("method", &self.request.method)
            .field("status", &self.info.status)
            .field("error", &self.error)
            .finish()
    }
}

impl TransportHandle for UreqHandle {
    fn reset(&mut self) {
        self.request = RequestState::default();
        self.info = TransferInfo::default();
        self.error = TransferErrorKind::None;
        self.error_message.clear();
    }

    fn set_option(&mut self, option: TransportOption) -> Result<()> {
        let request = &mut self.request;
        match option {
            TransportOption::Url(url) => request.url = Some(url),
            TransportOption::Method(method) => request.method = method,
            TransportOption::Headers(lines) => request.headers = lines,
            TransportOption::Body(body) => request.body = body,
            TransportOption::Cookie(cookie) => request.cookie = cookie,
            TransportOption::BasicAuth { username, password } => {
                request.basic_auth = Some((username, password));
            }
            TransportOption::Proxy(proxy) => request.proxy = proxy,
            TransportOption::UserAgent(user_agent) => request.user_agent = user_agent,
            TransportOption::Referer(referer) => request.referer = referer,
            TransportOption::FollowRedirects(follow) => request.follow_redirects = follow,
            TransportOption::MaxRedirects(max) => request.max_redirects = max,
            TransportOption::Timeout(timeout) => request.timeout = timeout,
            TransportOption::VerifyPeer(verify) => request.verify_peer = verify,
            TransportOption::VerifyHost(verify) => request.verify_host = verify,
            TransportOption::CaFile(path) => {
                if let Some(path) = &path
                    && !path.is_file()
                {
                    return Err(Error::CaFileNotFound { path: path.clone() });
                }
                request.ca_file = path;
            }
            TransportOption::AcceptEncoding(encoding) => request.accept_encoding = encoding,
            TransportOption::HeaderSink(sink) => request.header_sink = Some(sink),
            TransportOption::ProgressSink(sink) => request.progress_sink = sink,
            TransportOption::Destination(destination) => request.destination = destination,
        }
        Ok(())
    }

    fn perform(&mut self) -> Option<Bytes> {
        let started = Instant::now();
        self.info = TransferInfo::default();
        self.error = TransferErrorKind::None;
        self.error_message.clear();

        let result = self.run(started);
        self.info.total_time = started.elapsed();
        match result {
            Ok(content) => Some(content),
            Err(failure) => {
                debug!(
                    error = %failure.kind,
                    message = %failure.message,
                    "transfer failed"
                );
                self.error = failure.kind;
                self.error_message = failure.message;
                None
            }
        }
    }

    fn info(&self) -> TransferInfo {
        self.info.clone()
    }

    fn error(&self) -> TransferErrorKind {
        self.error
    }

    fn error_message(&self) -> String {
        self.error_message.clone()
    }
}

fn parse_target(url: &str) -> std::result::Result<url::Url, Failure> {
    let parsed = url::Url::parse(url).map_err(|error| {
        Failure::new(
            TransferErrorKind::UrlMalformat,
            format!("malformed url {}: {error}", redact_url_for_logs(url)),
        )
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Failure::new(
            TransferErrorKind::UnsupportedProtocol,
            format!("unsupported protocol {scheme}"),
        )),
    }
}

fn remaining_timeout(deadline: Option<Instant>) -> std::result::Result<Option<Duration>, Failure> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(Failure::new(
            TransferErrorKind::Timeout,
            "operation timed out before the transfer completed",
        ));
    }
    Ok(Some(remaining))
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// 303 turns anything but HEAD into GET; 301 and 302 do so only for POST.
fn redirect_method(method: &Method, status: u16) -> Method {
    match status {
        303 if *method != Method::HEAD => Method::GET,
        301 | 302 if *method == Method::POST => Method::GET,
        _ => method.clone(),
    }
}

fn run_configured_request<S: ureq::AsSendBody>(
    agent: &ureq::Agent,
    request: ureq::http::Request<S>,
    timeout: Option<Duration>,
) -> std::result::Result<ureq::http::Response<ureq::Body>, Failure> {
    let configured_request = agent
        .configure_request(request)
        .timeout_global(timeout)
        .build();
    agent
        .run(configured_request)
        .map_err(|error| Failure::from_ureq(&error))
}
