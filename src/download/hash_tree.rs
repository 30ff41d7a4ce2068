use crate::download::interval::Interval;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const HASH_LEN: usize = 32;
pub const MIN_CHUNK_SIZE: u64 = 1024;
pub const MAX_LEAVES: u64 = 512;
pub const URN_PREFIX: &str = "urn:sha256:";

pub type ChunkHash = [u8; HASH_LEN];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashTreeError {
    ChunkSizeNotPowerOfTwo(u64),
    ChunkSizeTooSmall(u64),
    LeafCountMismatch { expected: u64, actual: usize },
    BadLeafHex(usize),
}

impl std::fmt::Display for HashTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChunkSizeNotPowerOfTwo(size) => {
                write!(f, "hash tree chunk size {size} is not a power of two")
            }
            Self::ChunkSizeTooSmall(size) => {
                write!(f, "hash tree chunk size {size} < {MIN_CHUNK_SIZE}")
            }
            Self::LeafCountMismatch { expected, actual } => {
                write!(f, "hash tree has {actual} leaves, expected {expected}")
            }
            Self::BadLeafHex(idx) => write!(f, "hash tree leaf {idx} is not 32 bytes of hex"),
        }
    }
}

impl std::error::Error for HashTreeError {}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

fn hash_array(s: &str) -> Option<ChunkHash> {
    from_hex(s)?.try_into().ok()
}

/// SHA-256 of the whole file, rendered as `urn:sha256:<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(pub ChunkHash);

impl ContentHash {
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn parse_urn(s: &str) -> Option<Self> {
        let s = s.trim();
        let hex = match s.get(..URN_PREFIX.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(URN_PREFIX) => &s[URN_PREFIX.len()..],
            _ => s,
        };
        hash_array(hex).map(Self)
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    pub fn to_urn(&self) -> String {
        format!("{URN_PREFIX}{}", self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", crate::logging::redact_hex(&self.to_hex()))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_urn())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ContentHash::parse_urn(&value).ok_or_else(|| format!("invalid content hash '{value}'"))
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_urn()
    }
}

/// Streaming whole-file hasher.
#[derive(Default)]
pub struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

/// Per-chunk SHA-256 leaves over fixed power-of-two chunks.
///
/// Leaves hash `0x00 || chunk`, inner nodes hash `0x01 || left || right`;
/// an odd node at the end of a level is promoted unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HashTreeWire", into = "HashTreeWire")]
pub struct HashTree {
    file_size: u64,
    chunk_size: u64,
    leaves: Vec<ChunkHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashTreeWire {
    pub file_size: u64,
    pub chunk_size: u64,
    pub leaves: Vec<String>,
}

impl TryFrom<HashTreeWire> for HashTree {
    type Error = HashTreeError;

    fn try_from(value: HashTreeWire) -> Result<Self, Self::Error> {
        let leaves = value
            .leaves
            .iter()
            .enumerate()
            .map(|(i, s)| hash_array(s).ok_or(HashTreeError::BadLeafHex(i)))
            .collect::<Result<Vec<_>, _>>()?;
        HashTree::from_parts(value.file_size, value.chunk_size, leaves)
    }
}

impl From<HashTree> for HashTreeWire {
    fn from(value: HashTree) -> Self {
        Self {
            file_size: value.file_size,
            chunk_size: value.chunk_size,
            leaves: value.leaves.iter().map(|l| to_hex(l)).collect(),
        }
    }
}

/// Smallest power-of-two chunk (at least 64 KiB) keeping the leaf count
/// within [`MAX_LEAVES`].
pub fn suggested_chunk_size(file_size: u64) -> u64 {
    let mut chunk = 64 * 1024u64;
    while file_size.div_ceil(chunk) > MAX_LEAVES {
        chunk *= 2;
    }
    chunk
}

fn leaf_hash(data: &[u8]) -> ChunkHash {
    let mut h = Sha256::new();
    h.update([0u8]);
    h.update(data);
    h.finalize().into()
}

fn inner_hash(left: &ChunkHash, right: &ChunkHash) -> ChunkHash {
    let mut h = Sha256::new();
    h.update([1u8]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

fn validate_chunk_size(chunk_size: u64) -> Result<(), HashTreeError> {
    if chunk_size < MIN_CHUNK_SIZE {
        return Err(HashTreeError::ChunkSizeTooSmall(chunk_size));
    }
    if !chunk_size.is_power_of_two() {
        return Err(HashTreeError::ChunkSizeNotPowerOfTwo(chunk_size));
    }
    Ok(())
}

impl HashTree {
    pub fn build(data: &[u8], chunk_size: u64) -> Result<Self, HashTreeError> {
        validate_chunk_size(chunk_size)?;
        let leaves = data
            .chunks(chunk_size as usize)
            .map(leaf_hash)
            .collect::<Vec<_>>();
        Ok(Self {
            file_size: data.len() as u64,
            chunk_size,
            leaves,
        })
    }

    pub fn from_parts(
        file_size: u64,
        chunk_size: u64,
        leaves: Vec<ChunkHash>,
    ) -> Result<Self, HashTreeError> {
        validate_chunk_size(chunk_size)?;
        let expected = file_size.div_ceil(chunk_size);
        if leaves.len() as u64 != expected {
            return Err(HashTreeError::LeafCountMismatch {
                expected,
                actual: leaves.len(),
            });
        }
        Ok(Self {
            file_size,
            chunk_size,
            leaves,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn chunk_bounds(&self, index: usize) -> Option<Interval> {
        if index >= self.leaves.len() {
            return None;
        }
        let low = index as u64 * self.chunk_size;
        let high = (low + self.chunk_size).min(self.file_size) - 1;
        Some(Interval::new(low, high))
    }

    pub fn chunk_index(&self, offset: u64) -> usize {
        (offset / self.chunk_size) as usize
    }

    pub fn verify_chunk(&self, index: usize, data: &[u8]) -> bool {
        match (self.leaves.get(index), self.chunk_bounds(index)) {
            (Some(expected), Some(bounds)) => {
                bounds.len() == data.len() as u64 && leaf_hash(data) == *expected
            }
            _ => false,
        }
    }

    /// Whole chunks lying entirely inside `iv`.
    pub fn chunks_within(&self, iv: &Interval) -> Vec<(usize, Interval)> {
        let mut out = Vec::new();
        let mut idx = iv.low.div_ceil(self.chunk_size) as usize;
        while let Some(bounds) = self.chunk_bounds(idx) {
            if bounds.high > iv.high {
                break;
            }
            out.push((idx, bounds));
            idx += 1;
        }
        out
    }

    /// Chunk indices touched by any byte of `iv`.
    pub fn chunks_touching(&self, iv: &Interval) -> std::ops::RangeInclusive<usize> {
        let last = self.leaves.len().saturating_sub(1);
        self.chunk_index(iv.low).min(last)..=self.chunk_index(iv.high).min(last)
    }

    pub fn root(&self) -> ChunkHash {
        if self.leaves.is_empty() {
            return leaf_hash(&[]);
        }
        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [l, r] => inner_hash(l, r),
                    _ => pair[0],
                })
                .collect();
        }
        level[0]
    }

    pub fn root_hex(&self) -> String {
        to_hex(&self.root())
    }

    pub fn leaves_hex(&self) -> Vec<String> {
        self.leaves.iter().map(|l| to_hex(l)).collect()
    }
}
