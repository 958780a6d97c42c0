//! zlib/gzip helpers for message payloads and handshake data.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Second bytes that may follow `0x78` in a zlib header.
const ZLIB_LEVEL_BYTES: [u8; 4] = [0x9C, 0x01, 0xDA, 0x5E];

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Returns true if `data` starts with a zlib or gzip header.
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() > 2
        && ((data[0] == 0x78 && ZLIB_LEVEL_BYTES.contains(&data[1]))
            || data[..2] == GZIP_MAGIC)
}

fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

/// Inflates a zlib or gzip buffer.
pub fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    if is_gzip(data) {
        GzDecoder::new(data).read_to_end(&mut out)?;
    } else {
        ZlibDecoder::new(data).read_to_end(&mut out)?;
    }
    Ok(out)
}

/// Deflates `data` into a zlib stream.
pub fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
