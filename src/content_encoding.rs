use std::io::Read;

use bytes::Bytes;

use crate::error::Error;

/// Whether gzip response bodies can be decoded in this build.
pub const fn gzip_available() -> bool {
    cfg!(feature = "gzip")
}

pub(crate) fn declares_gzip(content_encoding: &str) -> bool {
    content_encoding
        .split(',')
        .map(str::trim)
        .any(|encoding| {
            encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip")
        })
}

#[cfg(feature = "gzip")]
pub(crate) fn decode_gzip(body: &[u8]) -> Result<Bytes, Error> {
    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];
    loop {
        let read = decoder
            .read(&mut chunk)
            .map_err(|error| Error::DecodeContentEncoding {
                encoding: "gzip".to_owned(),
                message: error.to_string(),
            })?;
        if read == 0 {
            break;
        }
        decoded.extend_from_slice(&chunk[..read]);
    }
    Ok(Bytes::from(decoded))
}

#[cfg(not(feature = "gzip"))]
pub(crate) fn decode_gzip(_body: &[u8]) -> Result<Bytes, Error> {
    Err(Error::DecodeContentEncoding {
        encoding: "gzip".to_owned(),
        message: "gzip support is not compiled in".to_owned(),
    })
}

/// Wraps `reader` so gzip content is decoded while it is read.
#[cfg(feature = "gzip")]
pub(crate) fn gzip_reader<'a, R>(reader: R) -> Box<dyn Read + 'a>
where
    R: Read + 'a,
{
    Box::new(flate2::read::GzDecoder::new(reader))
}

/// Without gzip support the content passes through undecoded.
#[cfg(not(feature = "gzip"))]
pub(crate) fn gzip_reader<'a, R>(reader: R) -> Box<dyn Read + 'a>
where
    R: Read + 'a,
{
    Box::new(reader)
}

#[cfg(all(test, feature = "gzip"))]
mod tests {
    use std::io::{Read, Write};

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::{declares_gzip, decode_gzip, gzip_reader};

    #[test]
    fn decodes_gzip_payload() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip").expect("write gzip");
        let compressed = encoder.finish().expect("finish gzip");

        let decoded = decode_gzip(&compressed).expect("decode gzip");
        assert_eq!(decoded.as_ref(), b"hello gzip");
    }

    #[test]
    fn gzip_reader_decodes_while_streaming() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"streamed gzip").expect("write gzip");
        let compressed = encoder.finish().expect("finish gzip");

        let mut decoded = String::new();
        gzip_reader(compressed.as_slice())
            .read_to_string(&mut decoded)
            .expect("decode gzip stream");
        assert_eq!(decoded, "streamed gzip");
    }

    #[test]
    fn rejects_corrupt_gzip() {
        let error = decode_gzip(b"not gzip at all").expect_err("corrupt gzip should fail");
        assert_eq!(error.code(), crate::ErrorCode::DecodeContentEncoding);
    }

    #[test]
    fn detects_gzip_in_encoding_lists() {
        assert!(declares_gzip("GZIP"));
        assert!(declares_gzip("identity, gzip"));
        assert!(!declares_gzip("br"));
    }
}
