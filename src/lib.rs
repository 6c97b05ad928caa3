//! `reqpool` is a blocking HTTP client engine built around reusable transfer
//! handles: layered request configuration, sequential retries with a fixed
//! backoff schedule, and windowed batches that return responses in the order
//! they were queued.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use reqpool::prelude::{Client, Method, RequestConfig};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")
//!         .timeout(Duration::from_secs(3))
//!         .max_retry(2)
//!         .build();
//!
//!     let response = client.post(
//!         "/v1/items",
//!         RequestConfig::new().json(&serde_json::json!({ "name": "demo" }))?,
//!     )?;
//!     if response.error_code().is_none() {
//!         let item: Item = response.json()?;
//!         println!("created id={}", item.id);
//!     }
//!
//!     let mut batch = client.batch();
//!     for page in 1..=10 {
//!         batch.enqueue(
//!             Method::GET,
//!             "/v1/items",
//!             RequestConfig::new().query_pair("page", page.to_string()),
//!         )?;
//!     }
//!     for response in batch.run_all() {
//!         println!("status={}", response?.status_code());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Transport failures never surface as `Err`: they are reported on the
//! [`Response`] through [`Response::error_code`] and
//! [`Response::error_message`]. Errors are reserved for invalid
//! configuration and for content that fails to decode.

#[cfg(all(not(feature = "tls-rustls"), not(feature = "tls-native")))]
compile_error!("reqpool requires one TLS backend feature: enable `tls-rustls` or `tls-native`");

mod batch;
mod body;
mod client;
mod config;
mod content_encoding;
mod cookie;
mod error;
mod handle;
mod headers;
mod multi;
mod response;
mod retry;
mod transport;
mod ureq_transport;
mod util;

pub use crate::batch::{BatchRun, BatchScheduler, DEFAULT_CONCURRENCY, MAX_RETRY_ROUNDS};
pub use crate::body::{Body, ContentType, EncodedBody, Field, FileUpload, infer_content_type};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{
    BasicAuth, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RETRY, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT,
    MAX_RETRY_COUNT, OptionName, RequestConfig,
};
pub use crate::content_encoding::gzip_available;
pub use crate::cookie::{CookieStore, MemoryCookieJar};
pub use crate::error::{Error, ErrorCode};
pub use crate::handle::TransferHandle;
pub use crate::headers::{HeaderCapture, HeaderSink, ResponseHeaders};
pub use crate::multi::ThreadMulti;
pub use crate::response::Response;
pub use crate::retry::{
    MAX_BACKOFF_TIMEOUT, RETRYABLE_STATUS_CODES, RetryDecision, RetryPolicy, backoff_timeout,
    next_attempt_timeout, should_retry,
};
pub use crate::transport::{
    CompletedTransfer, MethodMarker, MultiTransport, ProgressSink, SharedReader, SharedWriter,
    TransferBody, TransferErrorKind, TransferInfo, TransferProgress, Transport, TransportHandle,
    TransportOption, TransportOptionKey,
};
pub use crate::ureq_transport::{UreqHandle, UreqTransport};

pub use http::Method;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Body, Client, ClientBuilder, ContentType, CookieStore, Error, ErrorCode, MemoryCookieJar,
        Method, RequestConfig, Response, Result, TransferErrorKind,
    };
}

#[cfg(test)]
mod tests;
