use std::io::Read;

use super::FlashblockPayload;
use crate::DecodeError;
use crate::connection::Frame;

/// Turns a feed frame into JSON text.
///
/// Binary frames that already hold UTF-8 JSON are used as is, anything else is treated as
/// brotli-compressed JSON.
pub fn frame_text(frame: Frame) -> Result<String, DecodeError> {
    match frame {
        Frame::Text(text) => Ok(text),
        Frame::Binary(bytes) => {
            if let Ok(text) = std::str::from_utf8(&bytes) {
                if text.trim_start().starts_with('{') {
                    return Ok(text.to_string());
                }
            }

            let mut decompressor = brotli::Decompressor::new(bytes.as_slice(), 4096);
            let mut decompressed = Vec::new();
            decompressor
                .read_to_end(&mut decompressed)
                .map_err(DecodeError::Decompress)?;

            Ok(String::from_utf8(decompressed)?)
        }
    }
}

pub fn decode_frame(frame: Frame) -> Result<FlashblockPayload, DecodeError> {
    let text = frame_text(frame)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PAYLOAD: &str = r#"{"payload_id":"0x01","index":2,"diff":{"block_hash":"0x1111111111111111111111111111111111111111111111111111111111111111","transactions":["0x01"]},"metadata":{"block_number":42}}"#;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(data).unwrap();
        }
        out
    }

    #[test]
    fn test_decode_text_frame() {
        let payload = decode_frame(Frame::Text(PAYLOAD.to_string())).unwrap();
        assert_eq!(payload.index, 2);
        assert_eq!(payload.block_number(), Some(42));
    }

    #[test]
    fn test_decode_plain_binary_frame() {
        let payload = decode_frame(Frame::Binary(PAYLOAD.as_bytes().to_vec())).unwrap();
        assert_eq!(payload.transaction_count(), 1);
    }

    #[test]
    fn test_decode_brotli_frame() {
        let payload = decode_frame(Frame::Binary(compress(PAYLOAD.as_bytes()))).unwrap();
        assert_eq!(payload.index, 2);
        assert_eq!(payload.block_number(), Some(42));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_frame(Frame::Binary(vec![0xff, 0x00, 0x13, 0x37])),
            Err(DecodeError::Decompress(_)) | Err(DecodeError::Utf8(_)) | Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_frame(Frame::Text("{\"index\":".to_string())),
            Err(DecodeError::Json(_))
        ));
    }
}
