//! Object stream format.
//!
//! A stored file is `OBJECT_MAGIC`, the sealed attribute header, then the
//! file content cut into `BLOCK_SIZE` blocks that are sealed independently.
//! Independent blocks let the server assemble a new version from a patch that
//! reuses blocks of the previous version without ever seeing plaintext.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::FileAttributes;
use crate::crypto::{CryptoError, StoreKeys};

pub const BLOCK_SIZE: usize = 32 * 1024;

const OBJECT_MAGIC: &[u8; 4] = b"CFO1";
const PATCH_MAGIC: &[u8; 4] = b"CFP1";
const TAG_REUSE: u8 = 0;
const TAG_DATA: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("stream is truncated")]
    Truncated,
    #[error("stream has unknown magic")]
    BadMagic,
    #[error("patch refers to block {0} which the previous version does not have")]
    MissingBlock(u32),
}

/// Keyed hashes of each plaintext block of one stored version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireBlockIndex", into = "WireBlockIndex")]
pub struct BlockIndex {
    pub block_size: u32,
    pub hashes: Vec<[u8; 32]>,
}

#[derive(Serialize, Deserialize)]
struct WireBlockIndex {
    block_size: u32,
    #[serde(with = "crate::b64")]
    hashes: Vec<u8>,
}

impl From<BlockIndex> for WireBlockIndex {
    fn from(index: BlockIndex) -> Self {
        Self {
            block_size: index.block_size,
            hashes: index.hashes.concat(),
        }
    }
}

impl TryFrom<WireBlockIndex> for BlockIndex {
    type Error = String;

    fn try_from(wire: WireBlockIndex) -> Result<Self, Self::Error> {
        if wire.hashes.len() % 32 != 0 {
            return Err(format!("block hash list has odd length {}", wire.hashes.len()));
        }
        let hashes = wire
            .hashes
            .chunks_exact(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        Ok(Self {
            block_size: wire.block_size,
            hashes,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncodedObject {
    pub bytes: Vec<u8>,
    pub block_index: BlockIndex,
    /// Blocks taken over from the previous version; zero for full uploads.
    pub reused_blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedObject {
    pub attributes: FileAttributes,
    pub content: Vec<u8>,
}

pub fn encode_object(
    keys: &StoreKeys,
    attributes: &FileAttributes,
    content: &[u8],
) -> Result<EncodedObject, CodecError> {
    let mut bytes = Vec::with_capacity(content.len() + 256);
    bytes.extend_from_slice(OBJECT_MAGIC);
    write_sealed_header(keys, attributes, &mut bytes)?;

    let blocks: Vec<&[u8]> = content.chunks(BLOCK_SIZE).collect();
    bytes.extend_from_slice(&(blocks.len() as u32).to_be_bytes());
    let mut hashes = Vec::with_capacity(blocks.len());
    for block in blocks {
        write_chunk(&mut bytes, &keys.seal_block(block)?);
        hashes.push(keys.block_hash(block));
    }

    Ok(EncodedObject {
        bytes,
        block_index: BlockIndex {
            block_size: BLOCK_SIZE as u32,
            hashes,
        },
        reused_blocks: 0,
    })
}

/// Encodes `content` as a patch against the version described by `previous`.
///
/// Blocks are compared at equal offsets only.
pub fn encode_patch(
    keys: &StoreKeys,
    attributes: &FileAttributes,
    content: &[u8],
    previous: &BlockIndex,
) -> Result<EncodedObject, CodecError> {
    let mut bytes = Vec::with_capacity(content.len() / 2 + 256);
    bytes.extend_from_slice(PATCH_MAGIC);
    write_sealed_header(keys, attributes, &mut bytes)?;

    let blocks: Vec<&[u8]> = content.chunks(BLOCK_SIZE).collect();
    bytes.extend_from_slice(&(blocks.len() as u32).to_be_bytes());
    let comparable = previous.block_size as usize == BLOCK_SIZE;
    let mut hashes = Vec::with_capacity(blocks.len());
    let mut reused_blocks = 0;
    for (index, block) in blocks.into_iter().enumerate() {
        let hash = keys.block_hash(block);
        if comparable && previous.hashes.get(index) == Some(&hash) {
            bytes.push(TAG_REUSE);
            bytes.extend_from_slice(&(index as u32).to_be_bytes());
            reused_blocks += 1;
        } else {
            bytes.push(TAG_DATA);
            write_chunk(&mut bytes, &keys.seal_block(block)?);
        }
        hashes.push(hash);
    }

    Ok(EncodedObject {
        bytes,
        block_index: BlockIndex {
            block_size: BLOCK_SIZE as u32,
            hashes,
        },
        reused_blocks,
    })
}

pub fn decode_object(keys: &StoreKeys, stream: &[u8]) -> Result<DecodedObject, CodecError> {
    let mut reader = Reader::new(stream);
    if reader.take(OBJECT_MAGIC.len())? != OBJECT_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let header = reader.chunk()?;
    let attributes = keys.open_attributes(header)?;
    let count = reader.u32()?;
    let mut content = Vec::new();
    for _ in 0..count {
        content.extend_from_slice(&keys.open_block(reader.chunk()?)?);
    }
    Ok(DecodedObject {
        attributes,
        content,
    })
}

/// Builds the complete object stream a patch describes, given the stream of
/// the version it was computed against. Needs no keys.
pub fn apply_patch(previous: &[u8], patch: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut old = Reader::new(previous);
    if old.take(OBJECT_MAGIC.len())? != OBJECT_MAGIC {
        return Err(CodecError::BadMagic);
    }
    old.chunk()?;
    let old_count = old.u32()?;
    let mut old_blocks = Vec::with_capacity(old_count as usize);
    for _ in 0..old_count {
        old_blocks.push(old.chunk()?);
    }

    let mut reader = Reader::new(patch);
    if reader.take(PATCH_MAGIC.len())? != PATCH_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let header = reader.chunk()?;
    let count = reader.u32()?;

    let mut out = Vec::with_capacity(previous.len());
    out.extend_from_slice(OBJECT_MAGIC);
    write_chunk(&mut out, header);
    out.extend_from_slice(&count.to_be_bytes());
    for _ in 0..count {
        match reader.take(1)?[0] {
            TAG_REUSE => {
                let index = reader.u32()?;
                let block = old_blocks
                    .get(index as usize)
                    .ok_or(CodecError::MissingBlock(index))?;
                write_chunk(&mut out, block);
            }
            _ => write_chunk(&mut out, reader.chunk()?),
        }
    }
    Ok(out)
}

fn write_sealed_header(
    keys: &StoreKeys,
    attributes: &FileAttributes,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let sealed = keys.seal_attributes(attributes)?;
    write_chunk(out, &sealed);
    Ok(())
}

fn write_chunk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(bytes))
    }

    fn chunk(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
