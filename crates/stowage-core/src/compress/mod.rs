use std::io::Read;

use serde::{Deserialize, Serialize};

use stowage_types::error::{Result, StowageError};

/// Upper bound on a decoded payload. Blocks are far smaller; index volume
/// bodies stay well below it.
const MAX_DECODED_SIZE: u64 = 64 * 1024 * 1024;

const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Codec used for the blocks of a volume. The volume file extension names
/// it and every stored payload starts with its tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "raw",
            Compression::Lz4 => "lz4",
            Compression::Zstd { .. } => "zst",
        }
    }

    /// Codec of a volume, from its file extension.
    pub fn from_extension(ext: &str) -> Result<Self> {
        match ext {
            "raw" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zst" => Ok(Compression::Zstd {
                level: DEFAULT_ZSTD_LEVEL,
            }),
            other => Err(StowageError::UnknownCompression(other.to_string())),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd { .. } => 2,
        }
    }
}

/// Encode `data` as `[tag][payload]`.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![compression.tag()];
    match compression {
        Compression::None => out.extend_from_slice(data),
        Compression::Lz4 => out.extend_from_slice(&lz4_flex::compress_prepend_size(data)),
        Compression::Zstd { level } => {
            let packed = zstd::bulk::compress(data, level)
                .map_err(|e| StowageError::Other(format!("zstd compress: {e}")))?;
            out.extend_from_slice(&packed);
        }
    }
    Ok(out)
}

/// Decode a stored payload that must carry the tag of `expected`.
///
/// A volume whose extension names one codec while its payloads carry
/// another is reported rather than decoded.
pub fn decompress_expect(expected: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(StowageError::Decompression("empty payload".into()));
    };
    if tag != expected.tag() {
        return match tag {
            0..=2 => Err(StowageError::Decompression(format!(
                "payload tag {tag} does not match volume codec '{}'",
                expected.extension()
            ))),
            _ => Err(StowageError::UnknownCompressionTag(tag)),
        };
    }

    match expected {
        Compression::None => Ok(payload.to_vec()),
        Compression::Lz4 => {
            let declared = payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| StowageError::Decompression("lz4: payload too short".into()))?;
            if u64::from(declared) > MAX_DECODED_SIZE {
                return Err(StowageError::Decompression(format!(
                    "lz4: declared size {declared} exceeds {MAX_DECODED_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| StowageError::Decompression(format!("lz4: {e}")))
        }
        Compression::Zstd { .. } => {
            let decoder = zstd::stream::Decoder::new(payload)
                .map_err(|e| StowageError::Decompression(format!("zstd init: {e}")))?;
            let mut out = Vec::new();
            decoder
                .take(MAX_DECODED_SIZE + 1)
                .read_to_end(&mut out)
                .map_err(|e| StowageError::Decompression(format!("zstd: {e}")))?;
            if out.len() as u64 > MAX_DECODED_SIZE {
                return Err(StowageError::Decompression(format!(
                    "zstd: output exceeds {MAX_DECODED_SIZE} bytes"
                )));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODECS: [Compression; 3] = [
        Compression::None,
        Compression::Lz4,
        Compression::Zstd { level: 3 },
    ];

    #[test]
    fn every_codec_restores_its_input() {
        let payload = b"this payload is long enough to compress, compress, compress";
        for codec in CODECS {
            let encoded = compress(codec, payload).unwrap();
            assert_eq!(encoded[0], codec.tag());
            assert_eq!(decompress_expect(codec, &encoded).unwrap(), payload);
        }
    }

    #[test]
    fn lz4_size_claim_is_bounded() {
        let mut data = vec![Compression::Lz4.tag()];
        data.extend_from_slice(&(1u32 << 30).to_le_bytes());
        data.extend_from_slice(&[0u8; 10]);
        assert!(decompress_expect(Compression::Lz4, &data).is_err());
        assert!(decompress_expect(Compression::Lz4, &[1, 0, 0]).is_err());
    }

    #[test]
    fn foreign_or_unknown_tags_are_rejected() {
        let encoded = compress(Compression::Lz4, b"data").unwrap();
        assert!(matches!(
            decompress_expect(Compression::None, &encoded),
            Err(StowageError::Decompression(_))
        ));
        assert!(matches!(
            decompress_expect(Compression::None, &[9, 1, 2]),
            Err(StowageError::UnknownCompressionTag(9))
        ));
        assert!(decompress_expect(Compression::None, &[]).is_err());
    }

    #[test]
    fn extensions_name_the_codec() {
        for codec in CODECS {
            assert_eq!(Compression::from_extension(codec.extension()).unwrap(), codec);
        }
        assert!(matches!(
            Compression::from_extension("7z"),
            Err(StowageError::UnknownCompression(_))
        ));
    }
}
