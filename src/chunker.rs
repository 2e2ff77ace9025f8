//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Uniform random-access byte sources (C2): buffer, file, blob, HTTP range,
//! and one-shot stream, all behind the [`Chunker`] trait.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use crate::error::SourceError;

/// Resolve a `(byte_start?, byte_end?)` pair against a known total length,
/// per spec §4.1: absent bounds return the whole content, negative start is
/// relative to the end, positive end is exclusive.
fn resolve_range(byte_start: Option<i64>, byte_end: Option<i64>, len: u64) -> Result<(u64, u64), SourceError> {
    let start = match byte_start {
        None => 0,
        Some(s) if s >= 0 => s as u64,
        Some(s) => len.saturating_sub(s.unsigned_abs()),
    };
    let end = match byte_end {
        None => len,
        Some(e) if e >= 0 => e as u64,
        Some(_) => return Err(SourceError::UnsupportedRange),
    };
    if start > end || end > len {
        return Err(SourceError::OutOfBounds { start, end, len });
    }
    Ok((start, end))
}

/// A uniform random-access byte source.
///
/// Every implementation must satisfy: `read(a, b) == full()[a..b]`,
/// `read(Some(-k), None) == full()[len-k..]`, and reject a negative
/// `byte_end` with [`SourceError::UnsupportedRange`] unless the source is
/// local and seekable (buffer/file), per spec §4.1 and §8 "Chunker
/// semantics".
pub trait Chunker: Send + Sync {
    /// Total length of the underlying content, if known up front.
    fn len(&self) -> Result<u64, SourceError>;

    /// Read the half-open byte range `[byte_start, byte_end)`. Absent bounds
    /// default to the full content.
    fn read(&self, byte_start: Option<i64>, byte_end: Option<i64>) -> Result<Vec<u8>, SourceError>;

    fn is_empty(&self) -> Result<bool, SourceError> {
        Ok(self.len()? == 0)
    }
}

/// An in-memory buffer chunker. Negative `byte_end` is supported (it is a
/// local source).
pub struct BufferChunker {
    data: Vec<u8>,
}

impl BufferChunker {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Chunker for BufferChunker {
    fn len(&self) -> Result<u64, SourceError> {
        Ok(self.data.len() as u64)
    }

    fn read(&self, byte_start: Option<i64>, byte_end: Option<i64>) -> Result<Vec<u8>, SourceError> {
        let len = self.data.len() as u64;
        let end = match byte_end {
            Some(e) if e < 0 => len.saturating_sub(e.unsigned_abs()),
            _ => match byte_end {
                None => len,
                Some(e) => e as u64,
            },
        };
        let start = match byte_start {
            None => 0,
            Some(s) if s >= 0 => s as u64,
            Some(s) => len.saturating_sub(s.unsigned_abs()),
        };
        if start > end || end > len {
            return Err(SourceError::OutOfBounds { start, end, len });
        }
        Ok(self.data[start as usize..end as usize].to_vec())
    }
}

/// A local, seekable file chunker. Negative `byte_end` is supported.
pub struct FileChunker {
    path: std::path::PathBuf,
    len: u64,
}

impl FileChunker {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let len = std::fs::metadata(&path)?.len();
        Ok(Self { path, len })
    }
}

impl Chunker for FileChunker {
    fn len(&self) -> Result<u64, SourceError> {
        Ok(self.len)
    }

    fn read(&self, byte_start: Option<i64>, byte_end: Option<i64>) -> Result<Vec<u8>, SourceError> {
        let len = self.len;
        let end = match byte_end {
            Some(e) if e < 0 => len.saturating_sub(e.unsigned_abs()),
            _ => match byte_end {
                None => len,
                Some(e) => e as u64,
            },
        };
        let start = match byte_start {
            None => 0,
            Some(s) if s >= 0 => s as u64,
            Some(s) => len.saturating_sub(s.unsigned_abs()),
        };
        if start > end || end > len {
            return Err(SourceError::OutOfBounds { start, end, len });
        }
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// A browser `Blob`-backed chunker. On non-wasm targets this holds the blob
/// bytes already materialized (there is no browser runtime to defer to), so
/// its behavior degrades to [`BufferChunker`]; on `wasm32` targets a real
/// implementation would read the `Blob` lazily via `web_sys`.
#[cfg(target_arch = "wasm32")]
pub struct BlobChunker {
    inner: BufferChunker,
}

#[cfg(target_arch = "wasm32")]
impl BlobChunker {
    pub fn new(data: Vec<u8>) -> Self {
        Self { inner: BufferChunker::new(data) }
    }
}

#[cfg(target_arch = "wasm32")]
impl Chunker for BlobChunker {
    fn len(&self) -> Result<u64, SourceError> {
        self.inner.len()
    }

    fn read(&self, byte_start: Option<i64>, byte_end: Option<i64>) -> Result<Vec<u8>, SourceError> {
        self.inner.read(byte_start, byte_end)
    }
}

/// A one-shot byte stream, materialized into a buffer on first use (spec §9
/// "Polymorphic data source": the reader materializes Stream before random
/// access).
pub struct StreamChunker {
    materialized: std::sync::OnceLock<Vec<u8>>,
    source: std::sync::Mutex<Option<Box<dyn Read + Send>>>,
}

impl StreamChunker {
    pub fn new(source: Box<dyn Read + Send>) -> Self {
        Self {
            materialized: std::sync::OnceLock::new(),
            source: std::sync::Mutex::new(Some(source)),
        }
    }

    fn materialize(&self) -> Result<&Vec<u8>, SourceError> {
        if self.materialized.get().is_none() {
            let mut reader = self
                .source
                .lock()
                .expect("stream chunker mutex poisoned")
                .take()
                .expect("stream chunker read twice concurrently");
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            let _ = self.materialized.set(buf);
        }
        Ok(self.materialized.get().expect("just materialized"))
    }
}

impl Chunker for StreamChunker {
    fn len(&self) -> Result<u64, SourceError> {
        Ok(self.materialize()?.len() as u64)
    }

    fn read(&self, byte_start: Option<i64>, byte_end: Option<i64>) -> Result<Vec<u8>, SourceError> {
        let data = self.materialize()?;
        let len = data.len() as u64;
        let (start, end) = resolve_range(byte_start, byte_end, len)?;
        Ok(data[start as usize..end as usize].to_vec())
    }
}

/// A remote HTTP source read via `Range` requests, with idempotent-GET retry
/// and exponential backoff (spec §4.1: "retry idempotent GETs with
/// exponential backoff, at least 3 attempts"). Negative `byte_end` is
/// unsupported for remote sources per spec §4.1/§8.
pub struct RemoteChunker {
    client: reqwest::blocking::Client,
    url: String,
    len: std::sync::OnceLock<u64>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl RemoteChunker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            url: url.into(),
            len: std::sync::OnceLock::new(),
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }

    fn content_length(&self) -> Result<u64, SourceError> {
        if let Some(len) = self.len.get() {
            return Ok(*len);
        }
        let resp = self
            .client
            .head(&self.url)
            .send()
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let len = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| SourceError::Transport("missing Content-Length on HEAD response".to_string()))?;
        let _ = self.len.set(len);
        Ok(len)
    }

    fn get_range(&self, start: u64, end: u64) -> Result<Vec<u8>, SourceError> {
        let range_header = format!("bytes={}-{}", start, end.saturating_sub(1));
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .get(&self.url)
                .header(reqwest::header::RANGE, &range_header)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes());
            match result {
                Ok(bytes) => return Ok(bytes.to_vec()),
                Err(e) if attempt < self.max_attempts => {
                    std::thread::sleep(self.base_backoff * 2u32.pow(attempt - 1));
                    tracing::warn!(attempt, error = %e, "retrying remote chunker range read");
                }
                Err(e) => return Err(SourceError::Transport(e.to_string())),
            }
        }
    }
}

impl Chunker for RemoteChunker {
    fn len(&self) -> Result<u64, SourceError> {
        self.content_length()
    }

    fn read(&self, byte_start: Option<i64>, byte_end: Option<i64>) -> Result<Vec<u8>, SourceError> {
        if matches!(byte_end, Some(e) if e < 0) {
            return Err(SourceError::UnsupportedRange);
        }
        let len = self.content_length()?;
        let (start, end) = resolve_range(byte_start, byte_end, len)?;
        if start == end {
            return Ok(Vec::new());
        }
        self.get_range(start, end)
    }
}
