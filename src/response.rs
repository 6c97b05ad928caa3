use std::collections::BTreeMap;
use std::sync::OnceLock;

use bytes::Bytes;
use http::Method;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::Result;
use crate::content_encoding::{declares_gzip, decode_gzip, gzip_available};
use crate::error::Error;
use crate::headers::ResponseHeaders;
use crate::transport::{TransferErrorKind, TransferInfo};
use crate::util::truncate_body;

/// What the transport reported about one attempt, plus the request facts the
/// diagnostics map exposes.
#[derive(Clone, Debug, Default)]
pub(crate) struct Diagnostics {
    pub(crate) transfer: TransferInfo,
    pub(crate) error: TransferErrorKind,
    pub(crate) error_message: String,
    pub(crate) method: Method,
    pub(crate) retry_count: u32,
}

/// Outcome of one request.
///
/// Transport failures are data here, never errors: a failed transfer has no
/// content, a non-zero [`Response::error_code`] and status 0. Decoding errors
/// surface only when content is read.
#[derive(Clone, Debug)]
pub struct Response {
    content: Option<Bytes>,
    headers: ResponseHeaders,
    diagnostics: Diagnostics,
    gzip: bool,
    decoded: OnceLock<std::result::Result<Bytes, String>>,
    info: OnceLock<BTreeMap<String, Value>>,
}

impl Response {
    /// Synthetic response with the given status, headers and content.
    pub fn new(status: u16, headers: ResponseHeaders, content: impl Into<Bytes>) -> Self {
        let diagnostics = Diagnostics {
            transfer: TransferInfo {
                status,
                ..TransferInfo::default()
            },
            ..Diagnostics::default()
        };
        Self::from_parts(Some(content.into()), headers, diagnostics)
    }

    pub(crate) fn from_parts(
        content: Option<Bytes>,
        headers: ResponseHeaders,
        diagnostics: Diagnostics,
    ) -> Self {
        let gzip = gzip_available()
            && headers
                .get("content-encoding")
                .is_some_and(|values| values.iter().any(|value| declares_gzip(value)));
        Self {
            content,
            headers,
            diagnostics,
            gzip,
            decoded: OnceLock::new(),
            info: OnceLock::new(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.diagnostics.transfer.status
    }

    pub fn error_code(&self) -> TransferErrorKind {
        self.diagnostics.error
    }

    pub fn error_message(&self) -> &str {
        &self.diagnostics.error_message
    }

    pub fn is_timeout(&self) -> bool {
        self.diagnostics.error == TransferErrorKind::Timeout
    }

    /// `true` when the transfer produced no content at all.
    pub fn is_failure(&self) -> bool {
        self.content.is_none()
    }

    pub fn retry_count(&self) -> u32 {
        self.diagnostics.retry_count
    }

    pub fn method(&self) -> &Method {
        &self.diagnostics.method
    }

    pub fn effective_url(&self) -> &str {
        &self.diagnostics.transfer.effective_url
    }

    pub fn transfer_info(&self) -> &TransferInfo {
        &self.diagnostics.transfer
    }

    /// Values of `name`, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[String]> {
        self.headers.get(name)
    }

    /// Values of `name` joined with `", "`.
    pub fn header_line(&self, name: &str) -> Option<String> {
        self.headers.get_line(name)
    }

    pub fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }

    /// Raw content as received, before any content decoding.
    pub fn raw_content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    /// Response content, gzip-decoded when the response declared gzip
    /// encoding. Decoding runs once; its outcome is reused by later calls.
    pub fn content(&self) -> Result<Bytes> {
        let Some(content) = &self.content else {
            return Ok(Bytes::new());
        };
        if !self.gzip || content.is_empty() {
            return Ok(content.clone());
        }
        let decoded = self.decoded.get_or_init(|| {
            decode_gzip(content).map_err(|error| match error {
                Error::DecodeContentEncoding { message, .. } => message,
                other => other.to_string(),
            })
        });
        decoded
            .clone()
            .map_err(|message| Error::DecodeContentEncoding {
                encoding: "gzip".to_owned(),
                message,
            })
    }

    pub fn text(&self) -> Result<String> {
        let content = self.content()?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let content = self.content()?;
        serde_json::from_slice(&content).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&content),
        })
    }

    /// Content parsed as a generic JSON value. A response without content
    /// yields an empty object.
    pub fn to_structured(&self) -> Result<Value> {
        let content = self.content()?;
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Object(Map::new()));
        }
        self.json()
    }

    /// Replaces the content, for example with bytes obtained through another
    /// channel. With `is_gzip` the next read decodes it; decoding errors are
    /// reported by that read.
    pub fn set_content(&mut self, content: impl Into<Bytes>, is_gzip: bool) {
        self.content = Some(content.into());
        self.gzip = is_gzip;
        self.decoded = OnceLock::new();
    }

    /// Diagnostics map: status, method and retry count merged with the
    /// transport's timing, redirect and size metrics. Built on first use.
    pub fn info_map(&self) -> &BTreeMap<String, Value> {
        self.info.get_or_init(|| self.build_info_map())
    }

    pub fn info(&self, key: &str) -> Option<&Value> {
        self.info_map().get(key)
    }

    pub fn info_or(&self, key: &str, default: Value) -> Value {
        self.info(key).cloned().unwrap_or(default)
    }

    fn build_info_map(&self) -> BTreeMap<String, Value> {
        let transfer = &self.diagnostics.transfer;
        let mut info = BTreeMap::new();
        info.insert("status_code".to_owned(), Value::from(transfer.status));
        info.insert(
            "method".to_owned(),
            Value::from(self.diagnostics.method.as_str()),
        );
        info.insert(
            "retry_count".to_owned(),
            Value::from(self.diagnostics.retry_count),
        );
        info.insert(
            "effective_url".to_owned(),
            Value::from(transfer.effective_url.clone()),
        );
        info.insert(
            "redirect_count".to_owned(),
            Value::from(transfer.redirect_count),
        );
        info.insert(
            "total_time".to_owned(),
            Value::from(transfer.total_time.as_secs_f64()),
        );
        info.insert(
            "size_download".to_owned(),
            Value::from(transfer.size_download),
        );
        info.insert("size_upload".to_owned(), Value::from(transfer.size_upload));
        info.insert(
            "content_type".to_owned(),
            transfer
                .content_type
                .clone()
                .map_or(Value::Null, Value::from),
        );
        info.insert(
            "download_content_length".to_owned(),
            transfer
                .download_content_length
                .map_or(Value::Null, Value::from),
        );
        info.insert(
            "error_code".to_owned(),
            Value::from(self.diagnostics.error.code()),
        );
        info
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{Diagnostics, Response};
    use crate::ErrorCode;
    use crate::headers::ResponseHeaders;
    use crate::transport::{TransferErrorKind, TransferInfo};

    fn failed(error: TransferErrorKind) -> Response {
        Response::from_parts(
            None,
            ResponseHeaders::new(),
            Diagnostics {
                error,
                error_message: "boom".to_owned(),
                ..Diagnostics::default()
            },
        )
    }

    #[test]
    fn failed_transfer_reports_error_as_data() {
        let response = failed(TransferErrorKind::Timeout);
        assert!(response.is_failure());
        assert!(response.is_timeout());
        assert_eq!(response.status_code(), 0);
        assert_eq!(response.error_message(), "boom");
        assert_eq!(response.to_structured().expect("empty object"), json!({}));
    }

    #[test]
    fn header_lookup_joins_values() {
        let mut headers = ResponseHeaders::new();
        headers.append("X-Multi", "a");
        headers.append("x-multi", "b");
        let response = Response::new(200, headers, "ok");
        assert_eq!(response.header_line("X-MULTI").as_deref(), Some("a, b"));
        assert_eq!(response.header("x-multi").map(<[String]>::len), Some(2));
        assert_eq!(response.header_line("missing"), None);
    }

    #[test]
    fn invalid_json_is_a_decode_error() {
        let response = Response::new(200, ResponseHeaders::new(), "{not json");
        let error = response.to_structured().expect_err("invalid json");
        assert_eq!(error.code(), ErrorCode::Deserialize);
    }

    #[test]
    fn info_map_merges_fixed_fields_and_transfer_metrics() {
        let response = Response::from_parts(
            Some("x".into()),
            ResponseHeaders::new(),
            Diagnostics {
                transfer: TransferInfo {
                    status: 201,
                    redirect_count: 2,
                    size_download: 1,
                    ..TransferInfo::default()
                },
                method: http::Method::POST,
                retry_count: 1,
                ..Diagnostics::default()
            },
        );
        assert_eq!(response.info("status_code"), Some(&json!(201)));
        assert_eq!(response.info("method"), Some(&json!("POST")));
        assert_eq!(response.info("retry_count"), Some(&json!(1)));
        assert_eq!(response.info("redirect_count"), Some(&json!(2)));
        assert_eq!(response.info_or("missing", json!("fallback")), json!("fallback"));
        assert!(std::ptr::eq(response.info_map(), response.info_map()));
    }

    #[test]
    fn set_content_without_gzip_is_returned_verbatim() {
        let mut response = failed(TransferErrorKind::None);
        response.set_content("{\"saved\":true}", false);
        assert!(!response.is_failure());
        assert_eq!(
            response.to_structured().expect("json"),
            json!({"saved": true})
        );
        assert_eq!(response.info("status_code"), Some(&Value::from(0)));
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_content_is_decoded_once_and_errors_on_read() {
        use std::io::Write;

        use flate2::Compression;
        use flate2::write::GzEncoder;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"a\":1}").expect("write gzip");
        let compressed = encoder.finish().expect("finish gzip");

        let mut headers = ResponseHeaders::new();
        headers.append("Content-Encoding", "gzip");
        let response = Response::new(200, headers, compressed);
        assert_eq!(response.to_structured().expect("json"), json!({"a": 1}));
        assert_eq!(response.content().expect("cached"), response.content().expect("cached"));

        let mut corrupt = Response::new(200, ResponseHeaders::new(), "plain");
        corrupt.set_content("not gzip", true);
        let error = corrupt.content().expect_err("corrupt gzip");
        assert_eq!(error.code(), ErrorCode::DecodeContentEncoding);
        let again = corrupt.content().expect_err("cached failure");
        assert_eq!(again.code(), ErrorCode::DecodeContentEncoding);
    }
}
