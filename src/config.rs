//! Layered request configuration.
//!
//! A [`RequestConfig`] is built per request by merging a base configuration
//! (client defaults) with a per-call override. Map-valued options (query,
//! headers, cookies, raw transport options) are unioned with the override
//! winning per key; every other option is taken from the override when it sets
//! one and from the base otherwise.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde_json::Value;

use crate::Result;
use crate::body::{Body, ContentType, EncodedBody, encode_body, infer_content_type};
use crate::content_encoding::gzip_available;
use crate::cookie::CookieStore;
use crate::error::Error;
use crate::retry::next_attempt_timeout;
use crate::transport::{
    ProgressSink, TransportOption, TransportOptionKey, json_duration, json_string_pair, json_u64,
};
use crate::util::{
    append_query_pairs, merge_headers, parse_header_name, parse_header_value, resolve_url,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;
pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const MAX_RETRY_COUNT: u32 = 50;
pub const DEFAULT_USER_AGENT: &str = concat!("reqpool/", env!("CARGO_PKG_VERSION"));

/// Stable option names of the dynamic options surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionName {
    Url,
    Method,
    BaseUrl,
    Query,
    Body,
    ContentType,
    Headers,
    Cookies,
    UserAgent,
    Referer,
    AuthBasic,
    AuthBearer,
    Proxy,
    OnProgress,
    Timeout,
    MaxRedirects,
    MaxRetry,
    RetryCount,
    VerifyPeer,
    VerifyHost,
    CaFile,
    AcceptGzip,
    CookieJar,
    CurlOptions,
    SaveTo,
}

impl OptionName {
    pub const ALL: [Self; 25] = [
        Self::Url,
        Self::Method,
        Self::BaseUrl,
        Self::Query,
        Self::Body,
        Self::ContentType,
        Self::Headers,
        Self::Cookies,
        Self::UserAgent,
        Self::Referer,
        Self::AuthBasic,
        Self::AuthBearer,
        Self::Proxy,
        Self::OnProgress,
        Self::Timeout,
        Self::MaxRedirects,
        Self::MaxRetry,
        Self::RetryCount,
        Self::VerifyPeer,
        Self::VerifyHost,
        Self::CaFile,
        Self::AcceptGzip,
        Self::CookieJar,
        Self::CurlOptions,
        Self::SaveTo,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Method => "method",
            Self::BaseUrl => "baseUrl",
            Self::Query => "query",
            Self::Body => "body",
            Self::ContentType => "contentType",
            Self::Headers => "headers",
            Self::Cookies => "cookies",
            Self::UserAgent => "userAgent",
            Self::Referer => "referer",
            Self::AuthBasic => "authBasic",
            Self::AuthBearer => "authBearer",
            Self::Proxy => "proxy",
            Self::OnProgress => "onProgress",
            Self::Timeout => "timeout",
            Self::MaxRedirects => "maxRedirects",
            Self::MaxRetry => "maxRetry",
            Self::RetryCount => "retryCount",
            Self::VerifyPeer => "verifyPeer",
            Self::VerifyHost => "verifyHost",
            Self::CaFile => "cafile",
            Self::AcceptGzip => "acceptGzip",
            Self::CookieJar => "cookieJar",
            Self::CurlOptions => "curlOptions",
            Self::SaveTo => "saveTo",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|option| option.as_str() == name)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct RequestConfig {
    url: Option<String>,
    method: Option<Method>,
    base_url: Option<String>,
    query: BTreeMap<String, String>,
    body: Option<Body>,
    content_type: Option<ContentType>,
    headers: HeaderMap,
    cookies: BTreeMap<String, String>,
    user_agent: Option<String>,
    referer: Option<String>,
    auth_basic: Option<BasicAuth>,
    auth_bearer: Option<String>,
    proxy: Option<String>,
    on_progress: Option<Arc<dyn ProgressSink>>,
    timeout: Option<Duration>,
    max_redirects: Option<u32>,
    max_retry: Option<u32>,
    retry_count: Option<u32>,
    verify_peer: Option<bool>,
    verify_host: Option<bool>,
    ca_file: Option<PathBuf>,
    accept_gzip: Option<bool>,
    cookie_jar: Option<Arc<dyn CookieStore>>,
    save_to: Option<PathBuf>,
    transport_options: BTreeMap<TransportOptionKey, TransportOption>,
}

impl fmt::Debug for RequestConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RequestConfig")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("base_url", &self.base_url)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("content_type", &self.content_type)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("user_agent", &self.user_agent)
            .field("referer", &self.referer)
            .field("auth_basic", &self.auth_basic)
            .field("auth_bearer", &self.auth_bearer.as_ref().map(|_| "<redacted>"))
            .field("proxy", &self.proxy)
            .field("on_progress", &self.on_progress.is_some())
            .field("timeout", &self.timeout)
            .field("max_redirects", &self.max_redirects)
            .field("max_retry", &self.max_retry)
            .field("retry_count", &self.retry_count)
            .field("verify_peer", &self.verify_peer)
            .field("verify_host", &self.verify_host)
            .field("ca_file", &self.ca_file)
            .field("accept_gzip", &self.accept_gzip)
            .field("cookie_jar", &self.cookie_jar.is_some())
            .field("save_to", &self.save_to)
            .field("transport_options", &self.transport_options)
            .finish()
    }
}

impl RequestConfig {
    /// An empty configuration: nothing set, every map empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Global defaults every client starts from.
    pub fn defaults() -> Self {
        Self {
            method: Some(Method::GET),
            user_agent: Some(DEFAULT_USER_AGENT.to_owned()),
            timeout: Some(DEFAULT_TIMEOUT),
            max_redirects: Some(DEFAULT_MAX_REDIRECTS),
            max_retry: Some(DEFAULT_MAX_RETRY),
            verify_peer: Some(true),
            verify_host: Some(true),
            accept_gzip: Some(gzip_available()),
            ..Self::default()
        }
    }

    /// Builds a configuration from a JSON object keyed by option name.
    pub fn from_options(options: &Value) -> Result<Self> {
        let Some(options) = options.as_object() else {
            return Err(Error::invalid_option("options", "expected a json object"));
        };
        let mut config = Self::new();
        for (key, value) in options {
            config.set_option(key, value)?;
        }
        Ok(config)
    }

    /// Sets one option by its stable name.
    pub fn option(mut self, key: &str, value: Value) -> Result<Self> {
        self.set_option(key, &value)?;
        Ok(self)
    }

    pub fn set_option(&mut self, key: &str, value: &Value) -> Result<()> {
        let Some(name) = OptionName::parse(key) else {
            return Err(Error::UnknownOption {
                key: key.to_owned(),
            });
        };
        let invalid = |message: String| Error::invalid_option(key, message);

        match name {
            OptionName::Url => self.url = optional_string(value).map_err(invalid)?,
            OptionName::Method => {
                self.method = match optional_string(value).map_err(invalid)? {
                    Some(method) => Some(
                        Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                            .map_err(|_| Error::invalid_option(key, format!("invalid method {method}")))?,
                    ),
                    None => None,
                };
            }
            OptionName::BaseUrl => self.base_url = optional_string(value).map_err(invalid)?,
            OptionName::Query => {
                for (name, value) in scalar_map(value).map_err(invalid)? {
                    self.query.insert(name, value);
                }
            }
            OptionName::Body => {
                self.body = match value {
                    Value::Null => None,
                    Value::String(text) => Some(Body::Text(text.clone())),
                    Value::Object(_) => Some(Body::fields(scalar_map(value).map_err(invalid)?)),
                    other => Some(Body::Json(other.clone())),
                };
            }
            OptionName::ContentType => {
                self.content_type = optional_string(value)
                    .map_err(invalid)?
                    .map(|content_type| content_type_from_name(&content_type));
            }
            OptionName::Headers => {
                let Some(headers) = value.as_object() else {
                    return Err(invalid("expected a json object".to_owned()));
                };
                for (name, value) in headers {
                    let values = match value {
                        Value::Array(values) => values.iter().map(scalar_string).collect(),
                        other => vec![scalar_string(other)],
                    };
                    let header_name = parse_header_name(name)?;
                    self.headers.remove(&header_name);
                    for value in values {
                        let value = value.map_err(invalid)?;
                        let header_value = parse_header_value(name, &value)?;
                        self.headers.append(header_name.clone(), header_value);
                    }
                }
            }
            OptionName::Cookies => {
                for (name, value) in scalar_map(value).map_err(invalid)? {
                    self.cookies.insert(name, value);
                }
            }
            OptionName::UserAgent => self.user_agent = optional_string(value).map_err(invalid)?,
            OptionName::Referer => self.referer = optional_string(value).map_err(invalid)?,
            OptionName::AuthBasic => {
                self.auth_basic = match value {
                    Value::Null => None,
                    other => {
                        let (username, password) = json_string_pair(other).map_err(invalid)?;
                        Some(BasicAuth { username, password })
                    }
                };
            }
            OptionName::AuthBearer => self.auth_bearer = optional_string(value).map_err(invalid)?,
            OptionName::Proxy => self.proxy = optional_string(value).map_err(invalid)?,
            OptionName::OnProgress | OptionName::CookieJar => {
                return Err(invalid(
                    "holds a live object; use the typed setter".to_owned(),
                ));
            }
            OptionName::Timeout => {
                self.timeout = nullable(value, json_duration).map_err(invalid)?;
            }
            OptionName::MaxRedirects => {
                self.max_redirects = nullable(value, json_u32).map_err(invalid)?;
            }
            OptionName::MaxRetry => {
                self.max_retry = nullable(value, json_u32).map_err(invalid)?;
            }
            OptionName::RetryCount => {
                self.retry_count = match value {
                    Value::Null => None,
                    other => {
                        let count = other
                            .as_i64()
                            .ok_or_else(|| invalid("expected an integer".to_owned()))?;
                        Some(count.clamp(0, i64::from(MAX_RETRY_COUNT)) as u32)
                    }
                };
            }
            OptionName::VerifyPeer => self.verify_peer = nullable(value, json_bool).map_err(invalid)?,
            OptionName::VerifyHost => self.verify_host = nullable(value, json_bool).map_err(invalid)?,
            OptionName::AcceptGzip => self.accept_gzip = nullable(value, json_bool).map_err(invalid)?,
            OptionName::CaFile => {
                self.ca_file = match optional_string(value).map_err(invalid)? {
                    Some(path) => Some(existing_ca_file(Path::new(&path))?),
                    None => None,
                };
            }
            OptionName::SaveTo => {
                self.save_to = optional_string(value).map_err(invalid)?.map(PathBuf::from);
            }
            OptionName::CurlOptions => {
                let Some(options) = value.as_object() else {
                    return Err(invalid("expected a json object".to_owned()));
                };
                for (name, value) in options {
                    let Some(option_key) = TransportOptionKey::parse(name) else {
                        return Err(Error::UnknownOption {
                            key: format!("{key}.{name}"),
                        });
                    };
                    let option = TransportOption::from_json(option_key, value)
                        .map_err(|message| Error::invalid_option(&format!("{key}.{name}"), message))?;
                    self.transport_options.insert(option_key, option);
                }
            }
        }
        Ok(())
    }

    /// Combines `base` and `overrides`: maps are unioned with override
    /// entries winning, scalars come from the override when it sets them.
    pub fn merge(base: &Self, overrides: &Self) -> Self {
        fn pick<T: Clone>(overrides: &Option<T>, base: &Option<T>) -> Option<T> {
            overrides.clone().or_else(|| base.clone())
        }
        fn union<K: Ord + Clone, V: Clone>(
            base: &BTreeMap<K, V>,
            overrides: &BTreeMap<K, V>,
        ) -> BTreeMap<K, V> {
            let mut merged = base.clone();
            merged.extend(
                overrides
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
            merged
        }

        Self {
            url: pick(&overrides.url, &base.url),
            method: pick(&overrides.method, &base.method),
            base_url: pick(&overrides.base_url, &base.base_url),
            query: union(&base.query, &overrides.query),
            body: pick(&overrides.body, &base.body),
            content_type: pick(&overrides.content_type, &base.content_type),
            headers: merge_headers(&base.headers, &overrides.headers),
            cookies: union(&base.cookies, &overrides.cookies),
            user_agent: pick(&overrides.user_agent, &base.user_agent),
            referer: pick(&overrides.referer, &base.referer),
            auth_basic: pick(&overrides.auth_basic, &base.auth_basic),
            auth_bearer: pick(&overrides.auth_bearer, &base.auth_bearer),
            proxy: pick(&overrides.proxy, &base.proxy),
            on_progress: pick(&overrides.on_progress, &base.on_progress),
            timeout: pick(&overrides.timeout, &base.timeout),
            max_redirects: pick(&overrides.max_redirects, &base.max_redirects),
            max_retry: pick(&overrides.max_retry, &base.max_retry),
            retry_count: pick(&overrides.retry_count, &base.retry_count),
            verify_peer: pick(&overrides.verify_peer, &base.verify_peer),
            verify_host: pick(&overrides.verify_host, &base.verify_host),
            ca_file: pick(&overrides.ca_file, &base.ca_file),
            accept_gzip: pick(&overrides.accept_gzip, &base.accept_gzip),
            cookie_jar: pick(&overrides.cookie_jar, &base.cookie_jar),
            save_to: pick(&overrides.save_to, &base.save_to),
            transport_options: union(&base.transport_options, &overrides.transport_options),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|error| Error::invalid_option(OptionName::Query.as_str(), error.to_string()))?;
        self.query.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(mut self, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value).map_err(|source| Error::SerializeJson { source })?;
        self.body = Some(Body::Json(value));
        self.content_type = Some(ContentType::Json);
        Ok(self)
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn auth_basic(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth_basic = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn auth_bearer(mut self, token: impl Into<String>) -> Self {
        self.auth_bearer = Some(token.into());
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn on_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.on_progress = Some(sink);
        self
    }

    /// `Duration::ZERO` means no timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = Some(max_redirects);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count.min(MAX_RETRY_COUNT));
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = Some(verify);
        self
    }

    pub fn verify_host(mut self, verify: bool) -> Self {
        self.verify_host = Some(verify);
        self
    }

    /// Fails right away when `path` does not exist.
    pub fn ca_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.ca_file = Some(existing_ca_file(path.as_ref())?);
        Ok(self)
    }

    pub fn accept_gzip(mut self, accept: bool) -> Self {
        self.accept_gzip = Some(accept);
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieStore>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    /// Writes the response body to `path` while it is received instead of
    /// keeping it in memory. The file is created, or truncated, each time the
    /// request is applied to a handle.
    pub fn save_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_to = Some(path.into());
        self
    }

    /// Raw transport setting applied after, and winning over, every setting
    /// derived from this configuration.
    pub fn transport_option(mut self, option: TransportOption) -> Self {
        self.transport_options.insert(option.key(), option);
        self
    }

    pub fn get_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn get_method(&self) -> Method {
        self.method.clone().unwrap_or(Method::GET)
    }

    pub fn get_base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn get_query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn get_body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn get_content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    pub fn get_headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn get_cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn get_user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn get_referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    pub fn get_auth_basic(&self) -> Option<&BasicAuth> {
        self.auth_basic.as_ref()
    }

    pub fn get_auth_bearer(&self) -> Option<&str> {
        self.auth_bearer.as_deref()
    }

    pub fn get_proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn get_on_progress(&self) -> Option<&Arc<dyn ProgressSink>> {
        self.on_progress.as_ref()
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn get_max_redirects(&self) -> u32 {
        self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS)
    }

    pub fn get_max_retry(&self) -> u32 {
        self.max_retry.unwrap_or(DEFAULT_MAX_RETRY)
    }

    pub fn get_retry_count(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }

    pub fn get_verify_peer(&self) -> bool {
        self.verify_peer.unwrap_or(true)
    }

    pub fn get_verify_host(&self) -> bool {
        self.verify_host.unwrap_or(true)
    }

    pub fn get_ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }

    pub fn get_accept_gzip(&self) -> bool {
        self.accept_gzip.unwrap_or_else(gzip_available) && gzip_available()
    }

    pub fn get_cookie_jar(&self) -> Option<&Arc<dyn CookieStore>> {
        self.cookie_jar.as_ref()
    }

    pub fn get_save_to(&self) -> Option<&Path> {
        self.save_to.as_deref()
    }

    pub fn get_transport_options(&self) -> &BTreeMap<TransportOptionKey, TransportOption> {
        &self.transport_options
    }

    /// Moves to the next attempt: bumps the retry count (never past
    /// [`MAX_RETRY_COUNT`]) and shortens a bounded timeout to the backoff
    /// value. Returns the new retry count.
    pub(crate) fn advance_retry(&mut self) -> u32 {
        let retry_count = self
            .get_retry_count()
            .saturating_add(1)
            .min(MAX_RETRY_COUNT);
        self.retry_count = Some(retry_count);
        self.timeout = Some(next_attempt_timeout(self.get_timeout(), retry_count));
        retry_count
    }

    /// Full request URL: base URL joined with a relative path, then the query
    /// map appended after any query already present.
    pub fn build_full_url(&self) -> Result<String> {
        let path = self.url.as_deref().unwrap_or_default();
        let url = resolve_url(self.base_url.as_deref(), path);
        if url.is_empty() {
            return Err(Error::InvalidUri { uri: url });
        }
        let query_pairs = self
            .query
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect::<Vec<_>>();
        Ok(append_query_pairs(&url, &query_pairs))
    }

    /// Configured content type, or the one implied by the body.
    pub fn effective_content_type(&self) -> Option<ContentType> {
        self.content_type
            .clone()
            .or_else(|| self.body.as_ref().map(infer_content_type))
    }

    pub fn encode_body(&self) -> Result<Option<EncodedBody>> {
        let Some(body) = &self.body else {
            return Ok(None);
        };
        let content_type = self.effective_content_type();
        encode_body(body, content_type.as_ref()).map(Some)
    }
}

fn existing_ca_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(Error::CaFileNotFound {
            path: path.to_path_buf(),
        })
    }
}

fn content_type_from_name(name: &str) -> ContentType {
    match name.to_ascii_lowercase().as_str() {
        "form" => ContentType::Form,
        "multipart" => ContentType::Multipart,
        "json" => ContentType::Json,
        "xml" => ContentType::Xml,
        "text" => ContentType::Text,
        "binary" => ContentType::Binary,
        _ => ContentType::from_mime(name),
    }
}

fn nullable<T>(
    value: &Value,
    parse: impl FnOnce(&Value) -> std::result::Result<T, String>,
) -> std::result::Result<Option<T>, String> {
    match value {
        Value::Null => Ok(None),
        other => parse(other).map(Some),
    }
}

fn optional_string(value: &Value) -> std::result::Result<Option<String>, String> {
    nullable(value, |value| {
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| "expected a string".to_owned())
    })
}

fn json_bool(value: &Value) -> std::result::Result<bool, String> {
    value.as_bool().ok_or_else(|| "expected a boolean".to_owned())
}

fn json_u32(value: &Value) -> std::result::Result<u32, String> {
    let number = json_u64(value)?;
    u32::try_from(number).map_err(|_| "value too large".to_owned())
}

fn scalar_string(value: &Value) -> std::result::Result<String, String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err("expected a scalar value".to_owned()),
    }
}

fn scalar_map(value: &Value) -> std::result::Result<Vec<(String, String)>, String> {
    let Some(object) = value.as_object() else {
        return Err("expected a json object".to_owned());
    };
    object
        .iter()
        .map(|(name, value)| Ok((name.clone(), scalar_string(value)?)))
        .collect()
}
