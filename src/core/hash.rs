use image::{DynamicImage, ImageError, ImageReader};
use image::imageops::FilterType;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Default dhash grid size (8x8 comparisons, 64-bit fingerprint).
pub const DEFAULT_HASH_SIZE: u32 = 8;
/// Largest grid accepted: a 4096-bit fingerprint.
pub const MAX_HASH_SIZE: u32 = 64;

/// File extensions treated as images when walking a directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"];

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Image unreadable: {path}: {source}")]
    ImageUnreadable {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid fingerprint '{value}': expected an even number of hex digits")]
    InvalidHex { value: String },

    #[error("Fingerprint length mismatch: {left} bits vs {right} bits")]
    LengthMismatch { left: usize, right: usize },

    #[error("Unsupported hash size {size}: must be a positive multiple of 4, at most 64")]
    InvalidHashSize { size: u32 },
}

/// Difference-hash fingerprint, stored as packed bits (MSB first, row-major).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DHash(Vec<u8>);

impl DHash {
    /// Pack comparison bits into bytes. `bits.len()` must be a multiple of 8.
    pub fn from_bits(bits: &[bool]) -> Self {
        let bytes = bits
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .fold(0u8, |acc, &bit| (acc << 1) | u8::from(bit))
            })
            .collect();
        DHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Lowercase hexadecimal rendering.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Hamming distance between two fingerprints of equal bit length.
    pub fn distance(&self, other: &DHash) -> Result<u32, HashError> {
        if self.bit_len() != other.bit_len() {
            return Err(HashError::LengthMismatch {
                left: self.bit_len(),
                right: other.bit_len(),
            });
        }

        Ok(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum())
    }

    pub fn is_similar(&self, other: &DHash, threshold: u32) -> Result<bool, HashError> {
        Ok(self.distance(other)? <= threshold)
    }
}

impl fmt::Display for DHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for DHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HashError::InvalidHex {
            value: s.to_string(),
        };

        if s.is_empty() || s.len() % 2 != 0 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| invalid()))
            .collect::<Result<Vec<u8>, HashError>>()?;
        Ok(DHash(bytes))
    }
}

impl Serialize for DHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Hamming distance between two hex fingerprints.
pub fn distance(a: &DHash, b: &DHash) -> Result<u32, HashError> {
    a.distance(b)
}

/// `distance(a, b) <= threshold`.
pub fn are_similar(a: &DHash, b: &DHash, threshold: u32) -> Result<bool, HashError> {
    a.is_similar(b, threshold)
}

/// Anything that can turn an image file into a fingerprint.
///
/// Implementations must be pure with respect to the file contents so the
/// migration pipeline can call them from several threads at once.
pub trait Fingerprinter: Sync {
    fn fingerprint(&self, path: &Path) -> Result<DHash, HashError>;

    fn bit_len(&self) -> usize;
}

/// Computes difference hashes over an `(N+1) x N` grayscale grid.
#[derive(Debug, Clone)]
pub struct HashEngine {
    hash_size: u32,
    filter: FilterType,
}

impl HashEngine {
    pub fn new() -> Self {
        Self {
            hash_size: DEFAULT_HASH_SIZE,
            filter: FilterType::Lanczos3,
        }
    }

    pub fn with_hash_size(mut self, hash_size: u32) -> Result<Self, HashError> {
        if hash_size == 0 || hash_size % 4 != 0 || hash_size > MAX_HASH_SIZE {
            return Err(HashError::InvalidHashSize { size: hash_size });
        }
        self.hash_size = hash_size;
        Ok(self)
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    pub fn hash_size(&self) -> u32 {
        self.hash_size
    }

    /// Fingerprint an already decoded image.
    pub fn fingerprint_image(&self, image: &DynamicImage) -> DHash {
        let n = self.hash_size;
        let grid = image.resize_exact(n + 1, n, self.filter).to_luma8();

        let mut bits = Vec::with_capacity((n * n) as usize);
        for y in 0..n {
            for x in 0..n {
                let left = grid.get_pixel(x, y)[0];
                let right = grid.get_pixel(x + 1, y)[0];
                bits.push(left > right);
            }
        }

        DHash::from_bits(&bits)
    }
}

impl Default for HashEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive extension check against [`IMAGE_EXTENSIONS`].
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

impl Fingerprinter for HashEngine {
    fn fingerprint(&self, path: &Path) -> Result<DHash, HashError> {
        let unreadable = |source| HashError::ImageUnreadable {
            path: path.display().to_string(),
            source,
        };

        // sniff the format from content; data-URI scratch files may lack an extension
        let image = ImageReader::open(path)
            .map_err(|e| unreadable(ImageError::IoError(e)))?
            .with_guessed_format()
            .map_err(|e| unreadable(ImageError::IoError(e)))?
            .decode()
            .map_err(unreadable)?;
        Ok(self.fingerprint_image(&image))
    }

    fn bit_len(&self) -> usize {
        (self.hash_size * self.hash_size) as usize
    }
}
