use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;

/// An immutable in-memory file: body bytes plus the metadata needed to
/// serve and revalidate it. Constructed once by the origin client and
/// shared by reference afterwards.
#[derive(Debug)]
pub struct Blob {
    bytes: Bytes,
    content_type: String,
    etag: String,
    mtime: SystemTime,
    basename: String,
}

impl Blob {
    pub fn new(
        bytes: Bytes,
        content_type: String,
        etag: String,
        mtime: SystemTime,
        basename: String,
    ) -> Self {
        Self {
            bytes,
            content_type,
            etag,
            mtime,
            basename,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// The fully-qualified origin URL this blob was fetched from. Doubles
    /// as the name reported by the content-serving helper and as the URL
    /// the invalidator re-queries.
    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Hands out an independent cursor over the shared bytes. Cursors keep
    /// the body alive after the cache entry is gone.
    pub fn reader(self: &Arc<Self>) -> BlobReader {
        BlobReader {
            blob: Arc::clone(self),
            pos: 0,
        }
    }
}

pub struct BlobReader {
    blob: Arc<Blob>,
    pos: u64,
}

impl BlobReader {
    pub fn blob(&self) -> &Arc<Blob> {
        &self.blob
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = &self.blob.bytes;
        if self.pos >= bytes.len() as u64 {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BlobReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.blob.bytes.len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => len + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of blob",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
