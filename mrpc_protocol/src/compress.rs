use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use num_traits::FromPrimitive;

use crate::{CompressType, Error, ErrorKind, Result, MAX_FRAME_LEN};

impl CompressType {
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressType::CompressNone => Ok(data.to_vec()),
            CompressType::Gzip => {
                let mut e = GzEncoder::new(Vec::new(), Compression::default());
                e.write_all(data)
                    .map_err(|err| Error::new(ErrorKind::Compress, err))?;
                // finish writes the trailer; the bytes are incomplete without it.
                e.finish().map_err(|err| Error::new(ErrorKind::Compress, err))
            }
        }
    }

    /// Payloads never inflate beyond [`MAX_FRAME_LEN`].
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressType::CompressNone => Ok(data.to_vec()),
            CompressType::Gzip => {
                let mut d = GzDecoder::new(data).take(MAX_FRAME_LEN as u64 + 1);
                let mut out = Vec::new();
                d.read_to_end(&mut out)
                    .map_err(|err| Error::new(ErrorKind::Compress, err))?;
                if out.len() > MAX_FRAME_LEN {
                    return Err(Error::new(
                        ErrorKind::Compress,
                        format!("payload inflates beyond {} bytes", MAX_FRAME_LEN),
                    ));
                }
                Ok(out)
            }
        }
    }
}

pub fn compressor_of(code: u8) -> Result<CompressType> {
    CompressType::from_u8(code)
        .ok_or_else(|| Error::new(ErrorKind::Compress, format!("unknown compressor code {}", code)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip() {
        let data = br#"{"A":1,"B":2}"#.repeat(64);
        let compressed = CompressType::Gzip.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(data, CompressType::Gzip.decompress(&compressed).unwrap());
    }

    #[test]
    fn gzip_empty() {
        let compressed = CompressType::Gzip.compress(&[]).unwrap();
        assert!(CompressType::Gzip.decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn inflation_is_capped() {
        let bomb = CompressType::Gzip.compress(&vec![0u8; MAX_FRAME_LEN + 1]).unwrap();
        assert!(bomb.len() < 64 * 1024);
        let err = CompressType::Gzip.decompress(&bomb).unwrap_err();
        assert_eq!(ErrorKind::Compress, err.kind());

        let limit = CompressType::Gzip.compress(&vec![0u8; MAX_FRAME_LEN]).unwrap();
        assert_eq!(MAX_FRAME_LEN, CompressType::Gzip.decompress(&limit).unwrap().len());
    }

    #[test]
    fn corrupted_input() {
        let err = CompressType::Gzip.decompress(b"not gzip").unwrap_err();
        assert_eq!(ErrorKind::Compress, err.kind());
        assert!(compressor_of(9).is_err());
    }
}
