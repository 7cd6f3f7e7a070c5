//! Block payload codec and digests

use crate::error::{FerryError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::packet::DataBlock;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Capabilities both peers agreed on for the block loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockOptions {
    pub compression: bool,
    pub block_digest: bool,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Build the DATA payload for block `rank`.
///
/// Compressed output is only kept when it is smaller than the input.
pub fn pack(rank: u64, bytes: &[u8], options: BlockOptions) -> Result<DataBlock> {
    let digest = options.block_digest.then(|| sha256_hex(bytes));

    if options.compression && !bytes.is_empty() {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len()), Compression::fast());
        encoder.write_all(bytes)?;
        let compressed = encoder.finish()?;
        if compressed.len() < bytes.len() {
            return Ok(DataBlock {
                rank,
                compressed: true,
                digest,
                payload: compressed,
            });
        }
    }

    Ok(DataBlock {
        rank,
        compressed: false,
        digest,
        payload: bytes.to_vec(),
    })
}

/// Recover the block bytes, enforcing what was negotiated
pub fn unpack(block: DataBlock, blocksize: u32, options: BlockOptions) -> Result<Vec<u8>> {
    if block.compressed && !options.compression {
        return Err(FerryError::Protocol(format!(
            "block {} is compressed but compression was not negotiated",
            block.rank
        )));
    }

    let bytes = if block.compressed {
        let mut out = Vec::with_capacity(blocksize as usize);
        ZlibDecoder::new(block.payload.as_slice())
            .take(blocksize as u64 + 1)
            .read_to_end(&mut out)?;
        out
    } else {
        block.payload
    };

    if bytes.len() > blocksize as usize {
        return Err(FerryError::Protocol(format!(
            "block {} carries {} bytes, above blocksize {}",
            block.rank,
            bytes.len(),
            blocksize
        )));
    }

    match (options.block_digest, block.digest) {
        (true, Some(expected)) => {
            let actual = sha256_hex(&bytes);
            if actual != expected {
                return Err(FerryError::Integrity { expected, actual });
            }
        }
        (true, None) => {
            return Err(FerryError::Protocol(format!("block {} has no digest", block.rank)));
        }
        (false, Some(_)) => {
            return Err(FerryError::Protocol(format!(
                "block {} has a digest but block digests were not negotiated",
                block.rank
            )));
        }
        (false, None) => {}
    }

    Ok(bytes)
}

/// SHA-256 of a whole file, hex encoded
pub async fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: BlockOptions = BlockOptions {
        compression: true,
        block_digest: true,
    };

    #[test]
    fn compressible_blocks_shrink() {
        let bytes = vec![b'a'; 4096];
        let block = pack(3, &bytes, BOTH).unwrap();
        assert!(block.compressed);
        assert!(block.payload.len() < bytes.len());
        assert_eq!(unpack(block, 4096, BOTH).unwrap(), bytes);
    }

    #[test]
    fn incompressible_blocks_stay_raw() {
        // A short sequence with no repetition does not deflate.
        let bytes: Vec<u8> = (0..=255u8).collect();
        let block = pack(0, &bytes, BOTH).unwrap();
        assert!(!block.compressed);
        assert_eq!(block.payload, bytes);
    }

    #[test]
    fn corrupted_block_fails_its_digest() {
        let mut block = pack(0, b"hello world", BlockOptions {
            compression: false,
            block_digest: true,
        })
        .unwrap();
        block.payload[0] = b'j';
        let result = unpack(block, 64, BlockOptions {
            compression: false,
            block_digest: true,
        });
        assert!(matches!(result, Err(FerryError::Integrity { .. })));
    }

    #[test]
    fn capabilities_must_match_negotiation() {
        let compressed = pack(0, &[0u8; 2048], BOTH).unwrap();
        assert!(matches!(
            unpack(compressed, 2048, BlockOptions::default()),
            Err(FerryError::Protocol(_))
        ));

        let raw = pack(0, b"abc", BlockOptions::default()).unwrap();
        assert!(matches!(
            unpack(raw, 2048, BOTH),
            Err(FerryError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_block_is_rejected() {
        let block = pack(0, &[1u8; 100], BlockOptions::default()).unwrap();
        assert!(unpack(block, 10, BlockOptions::default()).is_err());
    }

    #[tokio::test]
    async fn file_digest_matches_in_memory_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();
        assert_eq!(file_digest(&path).await.unwrap(), sha256_hex(&data));
    }
}
