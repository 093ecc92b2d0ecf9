//! Compression and decompression of chunk payloads

use crate::error::{Result, VdsError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods a layout can request for its chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    None = 0,
    /// Lossy wavelet compression
    Wavelet = 1,
    /// Run-length encoding of whole elements
    Rle = 2,
    /// Raw deflate stream
    Zip = 3,
    /// Lossy wavelet compression with per-block normalization
    WaveletNormalizeBlock = 4,
    /// Lossless wavelet compression
    WaveletLossless = 5,
    /// Lossless wavelet compression with per-block normalization
    WaveletNormalizeBlockLossless = 6,
    Zstd = 7,
}

impl CompressionMethod {
    /// Inverse of `as u8`
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Wavelet),
            2 => Some(CompressionMethod::Rle),
            3 => Some(CompressionMethod::Zip),
            4 => Some(CompressionMethod::WaveletNormalizeBlock),
            5 => Some(CompressionMethod::WaveletLossless),
            6 => Some(CompressionMethod::WaveletNormalizeBlockLossless),
            7 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }

    pub fn is_wavelet(&self) -> bool {
        matches!(
            self,
            CompressionMethod::Wavelet
                | CompressionMethod::WaveletNormalizeBlock
                | CompressionMethod::WaveletLossless
                | CompressionMethod::WaveletNormalizeBlockLossless
        )
    }

    /// True when the method may discard information
    pub fn is_lossy(&self) -> bool {
        matches!(
            self,
            CompressionMethod::Wavelet | CompressionMethod::WaveletNormalizeBlock
        )
    }
}

/// Level passed to Deflate and Zstd, clamped to 0..=9
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Trait for compression/decompression of one chunk payload
pub trait Compressor: Send + Sync {
    /// Compress data made of elements of `element_size` bytes
    fn compress(&self, data: &[u8], element_size: usize, level: CompressionLevel)
        -> Result<Vec<u8>>;

    /// Decompress data, `expected_size` is the exact decoded length
    fn decompress(&self, data: &[u8], element_size: usize, expected_size: usize)
        -> Result<Vec<u8>>;

    fn method(&self) -> CompressionMethod;
}

fn check_size(method: CompressionMethod, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(VdsError::Codec(format!(
            "{:?} payload decoded to {} bytes, expected {}",
            method, actual, expected
        )));
    }
    Ok(())
}

/// Payload stored as is
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _element_size: usize, _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _element_size: usize, expected_size: usize) -> Result<Vec<u8>> {
        check_size(self.method(), data.len(), expected_size)?;
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

/// Raw deflate via flate2
#[derive(Debug, Default)]
pub struct ZipCompressor;

impl Compressor for ZipCompressor {
    fn compress(&self, data: &[u8], _element_size: usize, level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| VdsError::Codec(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], _element_size: usize, expected_size: usize) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data);
        let mut decompressed = Vec::with_capacity(expected_size);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| VdsError::Codec(e.to_string()))?;
        check_size(self.method(), decompressed.len(), expected_size)?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zip
    }
}

#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], _element_size: usize, level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32).map_err(|e| VdsError::Codec(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _element_size: usize, expected_size: usize) -> Result<Vec<u8>> {
        let decompressed = zstd::decode_all(data).map_err(|e| VdsError::Codec(e.to_string()))?;
        check_size(self.method(), decompressed.len(), expected_size)?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Run-length encoding over whole elements.
///
/// Each run is stored as a one byte count (1-255) followed by the element.
#[derive(Debug, Default)]
pub struct RleCompressor;

impl RleCompressor {
    fn encode_runs(data: &[u8], element_size: usize) -> Vec<u8> {
        let mut compressed = Vec::new();
        let mut elements = data.chunks(element_size).peekable();

        while let Some(element) = elements.next() {
            let mut count = 1u8;
            while count < u8::MAX && elements.peek() == Some(&element) {
                elements.next();
                count += 1;
            }
            compressed.push(count);
            compressed.extend_from_slice(element);
        }

        compressed
    }

    fn decode_runs(data: &[u8], element_size: usize, expected_size: usize) -> Result<Vec<u8>> {
        let mut decompressed = Vec::with_capacity(expected_size);
        let mut rest = data;

        while let Some((&count, tail)) = rest.split_first() {
            let take = element_size.min(tail.len());
            if count == 0 || take == 0 || decompressed.len() >= expected_size {
                return Err(VdsError::Codec("Malformed RLE run".to_string()));
            }
            let element = &tail[..take];
            for _ in 0..count {
                decompressed.extend_from_slice(element);
            }
            rest = &tail[take..];
        }

        Ok(decompressed)
    }
}

impl Compressor for RleCompressor {
    fn compress(&self, data: &[u8], element_size: usize, _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(Self::encode_runs(data, element_size.max(1)))
    }

    fn decompress(&self, data: &[u8], element_size: usize, expected_size: usize) -> Result<Vec<u8>> {
        let decompressed = Self::decode_runs(data, element_size.max(1), expected_size)?;
        check_size(self.method(), decompressed.len(), expected_size)?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Rle
    }
}

/// Get a compressor for a given method.
///
/// Wavelet payloads need a dedicated codec and are rejected here.
pub fn get_compressor(method: CompressionMethod) -> Result<Box<dyn Compressor>> {
    match method {
        CompressionMethod::None => Ok(Box::new(NoneCompressor)),
        CompressionMethod::Zip => Ok(Box::new(ZipCompressor)),
        CompressionMethod::Rle => Ok(Box::new(RleCompressor)),
        CompressionMethod::Zstd => Ok(Box::new(ZstdCompressor)),
        wavelet => Err(VdsError::Codec(format!(
            "{:?} compression is not supported by this codec",
            wavelet
        ))),
    }
}
