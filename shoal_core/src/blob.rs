//! Append-only blob streams with per-blob framing and hashing.
//!
//! A stored blob is framed as magic, payload length, hash length, payload,
//! hash of the payload. Concatenating framed blobs yields a valid stream, so
//! shards can append to a shared file without coordination. Readers accept a
//! truncated or corrupt trailing frame as end of stream, which is what makes
//! concurrent cross-shard reads safe.

use crate::util::{hash, HASH_LEN};
use crate::ByteArray;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Marks the start of every stored blob.
pub const BLOB_MAGIC: [u8; 8] = *b"Shol\xfe\x01\xa5\x1f";

/// Upper bound on a single stored blob; larger length fields mean a corrupt
/// frame.
const MAX_BLOB_LEN: u64 = 1 << 32;

/// Frames `data` so that concatenated frames can be split apart again.
pub fn pack_blob(data: &[u8]) -> ByteArray {
    let digest = hash(data);
    let mut out = Vec::with_capacity(BLOB_MAGIC.len() + 16 + data.len() + digest.len());
    out.extend_from_slice(&BLOB_MAGIC);
    // Writing into a Vec cannot fail.
    out.write_u64::<LittleEndian>(data.len() as u64).unwrap();
    out.write_u64::<LittleEndian>(digest.len() as u64).unwrap();
    out.extend_from_slice(data);
    out.extend_from_slice(digest.as_bytes());
    out
}

/// Sequential reader over a stream of framed blobs.
pub trait BlobReader {
    /// Returns the next complete blob, or `None` at end of stream. A
    /// truncated or corrupt trailing frame is end of stream, not an error.
    fn next_blob(&mut self) -> io::Result<Option<ByteArray>>;
}

/// Appends framed blobs to a stream.
pub trait BlobAppender {
    fn append(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Factory for blob readers and appenders, plus the few raw file operations
/// the engine needs. The engine receives one of these at construction, so
/// alternative storage backends can be plugged in without touching the loop.
pub trait BlobStorage {
    fn reader(&self, path: &Path) -> io::Result<Box<dyn BlobReader>>;
    fn appender(&self, path: &Path) -> io::Result<Box<dyn BlobAppender>>;
    fn make_dir(&self, path: &Path) -> io::Result<()>;
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;
}

/// Local-filesystem storage, the standard implementation.
pub struct LocalBlobStorage;

struct LocalBlobReader {
    inner: BufReader<File>,
}

struct LocalBlobAppender {
    inner: File,
}

impl BlobStorage for LocalBlobStorage {
    fn reader(&self, path: &Path) -> io::Result<Box<dyn BlobReader>> {
        let file = File::open(path)?;
        Ok(Box::new(LocalBlobReader {
            inner: BufReader::new(file),
        }))
    }

    fn appender(&self, path: &Path) -> io::Result<Box<dyn BlobAppender>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(LocalBlobAppender { inner: file }))
    }

    fn make_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }
}

impl BlobReader for LocalBlobReader {
    fn next_blob(&mut self) -> io::Result<Option<ByteArray>> {
        let mut magic = [0u8; BLOB_MAGIC.len()];
        if !read_exact_or_eof(&mut self.inner, &mut magic)? || magic != BLOB_MAGIC {
            return Ok(None);
        }
        let mut lens = [0u8; 16];
        if !read_exact_or_eof(&mut self.inner, &mut lens)? {
            return Ok(None);
        }
        let payload_len = u64::from_le_bytes(lens[..8].try_into().unwrap());
        let hash_len = u64::from_le_bytes(lens[8..].try_into().unwrap());
        if payload_len > MAX_BLOB_LEN || hash_len != HASH_LEN as u64 {
            return Ok(None);
        }
        let mut payload = vec![0u8; payload_len as usize];
        if !read_exact_or_eof(&mut self.inner, &mut payload)? {
            return Ok(None);
        }
        let mut digest = [0u8; HASH_LEN];
        if !read_exact_or_eof(&mut self.inner, &mut digest)? {
            return Ok(None);
        }
        if hash(&payload).as_bytes() != digest {
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

impl BlobAppender for LocalBlobAppender {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(&pack_blob(data))?;
        self.inner.flush()
    }
}

/// Fills `buf` completely, or reports a clean end of stream with `false`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Writes `data` to `dir`/Hash(`data`).
pub fn write_to_hashed_file_in_dir(
    storage: &dyn BlobStorage,
    dir: &Path,
    data: &[u8],
) -> io::Result<()> {
    storage.make_dir(dir)?;
    storage.write_file(&dir.join(hash(data)), data)
}
