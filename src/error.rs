use std::path::PathBuf;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    UnknownOption,
    InvalidOption,
    CaFileNotFound,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    ReadBodyFile,
    HandleClosed,
    DecodeContentEncoding,
    Deserialize,
    Io,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownOption => "unknown_option",
            Self::InvalidOption => "invalid_option",
            Self::CaFileNotFound => "ca_file_not_found",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::ReadBodyFile => "read_body_file",
            Self::HandleClosed => "handle_closed",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::Deserialize => "deserialize",
            Self::Io => "io",
        }
    }

    /// Configuration errors are raised while a request is being built or
    /// applied, never while it is in flight.
    pub const fn is_configuration(self) -> bool {
        matches!(
            self,
            Self::UnknownOption
                | Self::InvalidOption
                | Self::CaFileNotFound
                | Self::InvalidUri
                | Self::InvalidHeaderName
                | Self::InvalidHeaderValue
        )
    }

    pub const fn is_decode(self) -> bool {
        matches!(self, Self::DecodeContentEncoding | Self::Deserialize)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown request option: {key}")]
    UnknownOption { key: String },
    #[error("invalid value for request option {key}: {message}")]
    InvalidOption { key: String, message: String },
    #[error("ca file does not exist: {}", path.display())]
    CaFileNotFound { path: PathBuf },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read request body file {}: {source}", path.display())]
    ReadBodyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transport handle is closed")]
    HandleClosed,
    #[error("failed to decode response content-encoding {encoding}: {message}")]
    DecodeContentEncoding { encoding: String, message: String },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownOption { .. } => ErrorCode::UnknownOption,
            Self::InvalidOption { .. } => ErrorCode::InvalidOption,
            Self::CaFileNotFound { .. } => ErrorCode::CaFileNotFound,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::ReadBodyFile { .. } => ErrorCode::ReadBodyFile,
            Self::HandleClosed => ErrorCode::HandleClosed,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    pub(crate) fn invalid_option(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.to_owned(),
            message: message.into(),
        }
    }
}
