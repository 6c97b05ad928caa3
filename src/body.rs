use std::fmt::Write as _;
use std::fs::File;
use std::path::PathBuf;

use bytes::Bytes;
use rand::Rng;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::transport::{SharedReader, TransferBody};

const BINARY_MIME: &str = "application/octet-stream";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentType {
    Form,
    Multipart,
    Json,
    Xml,
    Text,
    Binary,
    Custom(String),
}

impl ContentType {
    pub fn mime(&self) -> &str {
        match self {
            Self::Form => "application/x-www-form-urlencoded",
            Self::Multipart => "multipart/form-data",
            Self::Json => "application/json",
            Self::Xml => "application/xml",
            Self::Text => "text/plain",
            Self::Binary => BINARY_MIME,
            Self::Custom(mime) => mime,
        }
    }

    /// Maps a mime string (parameters ignored) back to a known type.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/x-www-form-urlencoded" => Self::Form,
            "multipart/form-data" => Self::Multipart,
            "application/json" => Self::Json,
            "application/xml" | "text/xml" => Self::Xml,
            "text/plain" => Self::Text,
            "application/octet-stream" => Self::Binary,
            _ => Self::Custom(mime.to_owned()),
        }
    }
}

/// File part of a multipart form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileUpload {
    pub path: PathBuf,
    pub file_name: Option<String>,
    pub mime: Option<String>,
}

impl FileUpload {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_name: None,
            mime: None,
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Text(String),
    File(FileUpload),
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<FileUpload> for Field {
    fn from(value: FileUpload) -> Self {
        Self::File(value)
    }
}

#[derive(Clone, Debug)]
pub enum Body {
    Text(String),
    Bytes(Bytes),
    /// Ordered form fields.
    Fields(Vec<(String, Field)>),
    Json(Value),
    /// Caller-supplied stream, sent as is.
    Stream(SharedReader),
    /// File streamed from disk; opened each time the body is encoded.
    File(PathBuf),
}

impl Body {
    pub fn fields<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Field>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Fields(
            fields
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    pub fn stream<R>(reader: R) -> Self
    where
        R: std::io::Read + Send + 'static,
    {
        Self::Stream(SharedReader::new(reader))
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Content type implied by a body when none is configured.
pub fn infer_content_type(body: &Body) -> ContentType {
    match body {
        Body::Fields(fields) => {
            if fields.iter().any(|(_, field)| matches!(field, Field::File(_))) {
                ContentType::Multipart
            } else {
                ContentType::Form
            }
        }
        Body::Stream(_) | Body::File(_) | Body::Bytes(_) => ContentType::Binary,
        Body::Json(_) => ContentType::Json,
        Body::Text(text) => {
            let text = text.trim();
            if text.starts_with('{') && text.ends_with('}') {
                ContentType::Json
            } else if text.starts_with('<') && text.ends_with('>') {
                ContentType::Xml
            } else {
                ContentType::Text
            }
        }
    }
}

/// A body ready for the transport, plus the content-type header value to send
/// with it (multipart bodies carry their boundary there).
#[derive(Clone, Debug)]
pub struct EncodedBody {
    pub body: TransferBody,
    pub content_type: Option<String>,
}

pub(crate) fn encode_body(body: &Body, content_type: Option<&ContentType>) -> Result<EncodedBody> {
    let declared = content_type.map(|content_type| content_type.mime().to_owned());
    let buffered = |bytes: Bytes, content_type: Option<String>| EncodedBody {
        body: TransferBody::Bytes(bytes),
        content_type,
    };

    match body {
        Body::Text(text) => Ok(buffered(Bytes::from(text.clone()), declared)),
        Body::Bytes(bytes) => Ok(buffered(bytes.clone(), declared)),
        Body::Json(value) => match content_type {
            Some(ContentType::Form) => {
                let fields = json_object_fields(value)?;
                Ok(buffered(encode_form(&fields)?, declared))
            }
            _ => {
                let encoded = serde_json::to_vec(value)
                    .map_err(|source| Error::SerializeJson { source })?;
                Ok(buffered(Bytes::from(encoded), declared))
            }
        },
        Body::Fields(fields) => match content_type {
            Some(ContentType::Json) => {
                let mut object = serde_json::Map::new();
                for (name, field) in fields {
                    let Field::Text(value) = field else {
                        return Err(Error::invalid_option(
                            "body",
                            format!("file field {name} cannot be encoded as json"),
                        ));
                    };
                    object.insert(name.clone(), Value::String(value.clone()));
                }
                let encoded = serde_json::to_vec(&Value::Object(object))
                    .map_err(|source| Error::SerializeJson { source })?;
                Ok(buffered(Bytes::from(encoded), declared))
            }
            Some(ContentType::Multipart) => {
                let boundary = format!("reqpool-{:016x}", rand::rng().random::<u64>());
                let encoded = encode_multipart(fields, &boundary)?;
                Ok(buffered(
                    encoded,
                    Some(format!("multipart/form-data; boundary={boundary}")),
                ))
            }
            _ => {
                let pairs = fields
                    .iter()
                    .map(|(name, field)| match field {
                        Field::Text(value) => Ok((name.clone(), value.clone())),
                        Field::File(_) => Err(Error::invalid_option(
                            "body",
                            format!("file field {name} requires a multipart content type"),
                        )),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(buffered(encode_form(&pairs)?, declared))
            }
        },
        Body::Stream(reader) => Ok(EncodedBody {
            body: TransferBody::Reader(reader.clone()),
            content_type: declared,
        }),
        Body::File(path) => {
            let file = File::open(path).map_err(|source| Error::ReadBodyFile {
                path: path.clone(),
                source,
            })?;
            Ok(EncodedBody {
                body: TransferBody::Reader(SharedReader::new(file)),
                content_type: declared,
            })
        }
    }
}

fn json_object_fields(value: &Value) -> Result<Vec<(String, String)>> {
    let Some(object) = value.as_object() else {
        return Err(Error::invalid_option(
            "body",
            "only json objects can be form encoded",
        ));
    };
    Ok(object
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect())
}

fn encode_form(pairs: &[(String, String)]) -> Result<Bytes> {
    serde_urlencoded::to_string(pairs)
        .map(Bytes::from)
        .map_err(|error| Error::invalid_option("body", error.to_string()))
}

fn encode_multipart(fields: &[(String, Field)], boundary: &str) -> Result<Bytes> {
    let mut encoded = Vec::new();
    for (name, field) in fields {
        let mut part_header = String::new();
        let _ = write!(part_header, "--{boundary}\r\n");
        match field {
            Field::Text(value) => {
                let _ = write!(
                    part_header,
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    escape_quoted(name)
                );
                encoded.extend_from_slice(part_header.as_bytes());
                encoded.extend_from_slice(value.as_bytes());
            }
            Field::File(upload) => {
                let contents =
                    std::fs::read(&upload.path).map_err(|source| Error::ReadBodyFile {
                        path: upload.path.clone(),
                        source,
                    })?;
                let file_name = upload.file_name.clone().unwrap_or_else(|| {
                    upload
                        .path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_else(|| name.clone())
                });
                let mime = upload.mime.as_deref().unwrap_or(BINARY_MIME);
                let _ = write!(
                    part_header,
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {mime}\r\n\r\n",
                    escape_quoted(name),
                    escape_quoted(&file_name)
                );
                encoded.extend_from_slice(part_header.as_bytes());
                encoded.extend_from_slice(&contents);
            }
        }
        encoded.extend_from_slice(b"\r\n");
    }
    encoded.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(Bytes::from(encoded))
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
