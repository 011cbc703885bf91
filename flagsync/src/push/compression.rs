use super::PayloadError;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::read::{GzDecoder, ZlibDecoder};
use std::io::Read;

/// Encoding of an inline payload, from the `c` field of an update notification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// Base64 only.
    #[default]
    None,
    Gzip,
    Zlib,
}

impl TryFrom<u8> for Compression {
    type Error = PayloadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Zlib),
            other => Err(PayloadError::UnknownCompression(other)),
        }
    }
}

/// Decodes a base64 payload and inflates it according to `compression`.
pub fn decode_payload(data: &str, compression: Compression) -> Result<Vec<u8>, PayloadError> {
    let raw = STANDARD.decode(data.trim())?;

    let mut decoded = Vec::new();
    match compression {
        Compression::None => return Ok(raw),
        Compression::Gzip => GzDecoder::new(raw.as_slice()).read_to_end(&mut decoded)?,
        Compression::Zlib => ZlibDecoder::new(raw.as_slice()).read_to_end(&mut decoded)?,
    };
    Ok(decoded)
}

#[cfg(test)]
pub(crate) fn encode_payload(data: &[u8], compression: Compression) -> String {
    use flate2::write::{GzEncoder, ZlibEncoder};
    use std::io::Write;

    let compressed = match compression {
        Compression::None => data.to_vec(),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        }
        Compression::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        }
    };
    STANDARD.encode(compressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = br#"{"name":"checkout","changeNumber":11}"#;

    #[test]
    fn test_decode_each_compression() {
        for compression in [Compression::None, Compression::Gzip, Compression::Zlib] {
            let encoded = encode_payload(PAYLOAD, compression);
            assert_eq!(decode_payload(&encoded, compression).unwrap(), PAYLOAD);
        }
    }

    #[test]
    fn test_compression_codes() {
        assert_eq!(Compression::try_from(1).unwrap(), Compression::Gzip);
        assert!(matches!(
            Compression::try_from(3),
            Err(PayloadError::UnknownCompression(3))
        ));
        assert_eq!(Compression::try_from(2).unwrap(), Compression::Zlib);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_payload("not base64!", Compression::None),
            Err(PayloadError::Base64(_))
        ));
        // Valid base64, not gzip
        let encoded = encode_payload(PAYLOAD, Compression::None);
        assert!(matches!(
            decode_payload(&encoded, Compression::Gzip),
            Err(PayloadError::Inflate(_))
        ));
    }
}
