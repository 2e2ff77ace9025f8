//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Hand-rolled ZIP container I/O (C3): a constrained ZIP layout carrying
//! exactly two STORED entries, `0.payload` and `0.manifest.json`, with
//! ZIP64 support beyond 4 GiB.
//!
//! No `zip` crate is used here; this crate hand-packs local file headers,
//! the central directory, and (when needed) the ZIP64 end-of-central-
//! directory record and locator, the same way the rest of this crate
//! hand-packs its other binary structures.

use std::io::Write;
use std::sync::Arc;

use crate::chunker::Chunker;
use crate::error::ContainerError;

pub const PAYLOAD_ENTRY_NAME: &str = "0.payload";
pub const MANIFEST_ENTRY_NAME: &str = "0.manifest.json";

const ZIP64_THRESHOLD: u64 = 0xFFFF_FFFF;
const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_DIR_HEADER_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_EOCD_LOCATOR_SIG: u32 = 0x0706_4b50;
const ZIP64_EXTRA_TAG: u16 = 0x0001;

struct EntryRecord {
    name: String,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
}

/// Write a two-entry STORED ZIP container carrying `payload` under
/// `0.payload` and `manifest_json` under `0.manifest.json`, emitted in that
/// order (spec §4.2).
pub fn write_container<W: Write>(sink: &mut W, payload: &[u8], manifest_json: &[u8]) -> Result<(), ContainerError> {
    let mut offset: u64 = 0;
    let mut records = Vec::with_capacity(2);

    for (name, data) in [(PAYLOAD_ENTRY_NAME, payload), (MANIFEST_ENTRY_NAME, manifest_json)] {
        let crc = crc32fast::hash(data);
        let needs_zip64 = data.len() as u64 > ZIP64_THRESHOLD || offset > ZIP64_THRESHOLD;
        let header_offset = offset;
        offset += write_local_file_header(sink, name, crc, data.len() as u64, needs_zip64)?;
        sink.write_all(data)?;
        offset += data.len() as u64;
        records.push(EntryRecord {
            name: name.to_string(),
            crc32: crc,
            compressed_size: data.len() as u64,
            uncompressed_size: data.len() as u64,
            local_header_offset: header_offset,
        });
    }

    let central_dir_start = offset;
    let mut central_dir_size: u64 = 0;
    for record in &records {
        central_dir_size += write_central_directory_header(sink, record)?;
    }
    let central_dir_end = central_dir_start + central_dir_size;

    let needs_zip64_eocd = records.len() as u64 > 0xFFFF
        || central_dir_size > ZIP64_THRESHOLD
        || central_dir_start > ZIP64_THRESHOLD;

    if needs_zip64_eocd {
        write_zip64_eocd_and_locator(sink, records.len() as u64, central_dir_size, central_dir_start, central_dir_end)?;
    }
    write_eocd(sink, records.len() as u16, central_dir_size, central_dir_start)?;
    Ok(())
}

fn write_local_file_header<W: Write>(
    sink: &mut W,
    name: &str,
    crc32: u32,
    size: u64,
    zip64: bool,
) -> Result<u64, ContainerError> {
    let name_bytes = name.as_bytes();
    let (size_field, extra) = if zip64 {
        (0xFFFF_FFFFu32, zip64_extra_field(size, size))
    } else {
        (size as u32, Vec::new())
    };

    sink.write_all(&LOCAL_FILE_HEADER_SIG.to_le_bytes())?;
    sink.write_all(&20u16.to_le_bytes())?; // version needed to extract
    sink.write_all(&0u16.to_le_bytes())?; // flags
    sink.write_all(&0u16.to_le_bytes())?; // method: STORED
    sink.write_all(&0u16.to_le_bytes())?; // mod time
    sink.write_all(&0u16.to_le_bytes())?; // mod date
    sink.write_all(&crc32.to_le_bytes())?;
    sink.write_all(&size_field.to_le_bytes())?; // compressed size
    sink.write_all(&size_field.to_le_bytes())?; // uncompressed size
    sink.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
    sink.write_all(&(extra.len() as u16).to_le_bytes())?;
    sink.write_all(name_bytes)?;
    sink.write_all(&extra)?;

    Ok(30 + name_bytes.len() as u64 + extra.len() as u64)
}

fn zip64_extra_field(uncompressed: u64, compressed: u64) -> Vec<u8> {
    let mut extra = Vec::with_capacity(20);
    extra.extend_from_slice(&ZIP64_EXTRA_TAG.to_le_bytes());
    extra.extend_from_slice(&16u16.to_le_bytes());
    extra.extend_from_slice(&uncompressed.to_le_bytes());
    extra.extend_from_slice(&compressed.to_le_bytes());
    extra
}

fn write_central_directory_header<W: Write>(sink: &mut W, record: &EntryRecord) -> Result<u64, ContainerError> {
    let name_bytes = record.name.as_bytes();
    let zip64 = record.uncompressed_size > ZIP64_THRESHOLD || record.local_header_offset > ZIP64_THRESHOLD;

    let (size_field, offset_field, extra) = if zip64 {
        let mut extra = Vec::with_capacity(28);
        extra.extend_from_slice(&ZIP64_EXTRA_TAG.to_le_bytes());
        extra.extend_from_slice(&24u16.to_le_bytes());
        extra.extend_from_slice(&record.uncompressed_size.to_le_bytes());
        extra.extend_from_slice(&record.compressed_size.to_le_bytes());
        extra.extend_from_slice(&record.local_header_offset.to_le_bytes());
        (0xFFFF_FFFFu32, 0xFFFF_FFFFu32, extra)
    } else {
        (record.uncompressed_size as u32, record.local_header_offset as u32, Vec::new())
    };

    sink.write_all(&CENTRAL_DIR_HEADER_SIG.to_le_bytes())?;
    sink.write_all(&20u16.to_le_bytes())?; // version made by
    sink.write_all(&20u16.to_le_bytes())?; // version needed
    sink.write_all(&0u16.to_le_bytes())?; // flags
    sink.write_all(&0u16.to_le_bytes())?; // method: STORED
    sink.write_all(&0u16.to_le_bytes())?; // mod time
    sink.write_all(&0u16.to_le_bytes())?; // mod date
    sink.write_all(&record.crc32.to_le_bytes())?;
    sink.write_all(&size_field.to_le_bytes())?; // compressed size
    sink.write_all(&size_field.to_le_bytes())?; // uncompressed size
    sink.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
    sink.write_all(&(extra.len() as u16).to_le_bytes())?;
    sink.write_all(&0u16.to_le_bytes())?; // comment length
    sink.write_all(&0u16.to_le_bytes())?; // disk number start
    sink.write_all(&0u16.to_le_bytes())?; // internal attrs
    sink.write_all(&0u32.to_le_bytes())?; // external attrs
    sink.write_all(&offset_field.to_le_bytes())?;
    sink.write_all(name_bytes)?;
    sink.write_all(&extra)?;

    Ok(46 + name_bytes.len() as u64 + extra.len() as u64)
}

fn write_zip64_eocd_and_locator<W: Write>(
    sink: &mut W,
    entry_count: u64,
    central_dir_size: u64,
    central_dir_start: u64,
    central_dir_end: u64,
) -> Result<(), ContainerError> {
    sink.write_all(&ZIP64_EOCD_SIG.to_le_bytes())?;
    sink.write_all(&44u64.to_le_bytes())?; // size of this record minus the first 12 bytes
    sink.write_all(&45u16.to_le_bytes())?; // version made by
    sink.write_all(&45u16.to_le_bytes())?; // version needed
    sink.write_all(&0u32.to_le_bytes())?; // disk number
    sink.write_all(&0u32.to_le_bytes())?; // disk with central dir
    sink.write_all(&entry_count.to_le_bytes())?; // entries on this disk
    sink.write_all(&entry_count.to_le_bytes())?; // total entries
    sink.write_all(&central_dir_size.to_le_bytes())?;
    sink.write_all(&central_dir_start.to_le_bytes())?;

    sink.write_all(&ZIP64_EOCD_LOCATOR_SIG.to_le_bytes())?;
    sink.write_all(&0u32.to_le_bytes())?; // disk with zip64 eocd
    sink.write_all(&central_dir_end.to_le_bytes())?; // offset of zip64 eocd
    sink.write_all(&1u32.to_le_bytes())?; // total number of disks
    Ok(())
}

fn write_eocd<W: Write>(sink: &mut W, entry_count: u16, central_dir_size: u64, central_dir_start: u64) -> Result<(), ContainerError> {
    let size_field = central_dir_size.min(ZIP64_THRESHOLD) as u32;
    let offset_field = central_dir_start.min(ZIP64_THRESHOLD) as u32;

    sink.write_all(&EOCD_SIG.to_le_bytes())?;
    sink.write_all(&0u16.to_le_bytes())?; // disk number
    sink.write_all(&0u16.to_le_bytes())?; // disk with central dir
    sink.write_all(&entry_count.to_le_bytes())?;
    sink.write_all(&entry_count.to_le_bytes())?;
    sink.write_all(&size_field.to_le_bytes())?;
    sink.write_all(&offset_field.to_le_bytes())?;
    sink.write_all(&0u16.to_le_bytes())?; // comment length
    Ok(())
}

/// A parsed central-directory entry, as found by [`ContainerReader::open`].
#[derive(Debug, Clone)]
struct DirectoryEntry {
    name: String,
    uncompressed_size: u64,
    local_header_offset: u64,
}

/// Reads a two-entry STORED ZIP container using only random-range reads
/// over a [`Chunker`] (spec §4.2: "must not require a full download to
/// locate the manifest").
pub struct ContainerReader {
    chunker: Arc<dyn Chunker>,
    entries: Vec<DirectoryEntry>,
}

impl ContainerReader {
    pub fn open(chunker: Arc<dyn Chunker>) -> Result<Self, ContainerError> {
        let total_len = chunker.len().map_err(|e| ContainerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        if total_len < 22 {
            return Err(ContainerError::Malformed("file shorter than minimum EOCD size".to_string()));
        }

        let tail_len = total_len.min(65536 + 22);
        let tail = chunker
            .read(Some(-(tail_len as i64)), None)
            .map_err(|e| ContainerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        let eocd_pos_in_tail = find_eocd(&tail)
            .ok_or_else(|| ContainerError::Malformed("end of central directory record not found".to_string()))?;

        let (mut central_dir_start, mut central_dir_size, mut entry_count) = parse_eocd(&tail[eocd_pos_in_tail..])?;

        if central_dir_start == 0xFFFF_FFFF || entry_count == 0xFFFF {
            let locator_pos = find_sig_before(&tail, eocd_pos_in_tail, ZIP64_EOCD_LOCATOR_SIG)
                .ok_or_else(|| ContainerError::Malformed("ZIP64 locator not found".to_string()))?;
            let zip64_eocd_offset = u64::from_le_bytes(tail[locator_pos + 8..locator_pos + 16].try_into().unwrap());
            let zip64_record = chunker
                .read(Some(zip64_eocd_offset as i64), Some((zip64_eocd_offset + 56) as i64))
                .map_err(|e| ContainerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            if zip64_record.len() < 56 || u32::from_le_bytes(zip64_record[0..4].try_into().unwrap()) != ZIP64_EOCD_SIG {
                return Err(ContainerError::Malformed("malformed ZIP64 end-of-central-directory record".to_string()));
            }
            entry_count = u64::from_le_bytes(zip64_record[32..40].try_into().unwrap());
            central_dir_size = u64::from_le_bytes(zip64_record[40..48].try_into().unwrap());
            central_dir_start = u64::from_le_bytes(zip64_record[48..56].try_into().unwrap());
        }

        let central_dir_bytes = chunker
            .read(Some(central_dir_start as i64), Some((central_dir_start + central_dir_size) as i64))
            .map_err(|e| ContainerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        let entries = parse_central_directory(&central_dir_bytes, entry_count)?;

        Ok(Self { chunker, entries })
    }

    /// Read the full bytes of an entry by name.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>, ContainerError> {
        self.read_entry_range(name, 0, None)
    }

    /// Read a byte range `[start, end)` from an entry's data region,
    /// skipping its local file header (and extra field) without ever
    /// reading the whole entry.
    pub fn read_entry_range(&self, name: &str, start: u64, end: Option<u64>) -> Result<Vec<u8>, ContainerError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ContainerError::EntryNotFound(name.to_string()))?;

        let header = self
            .chunker
            .read(Some(entry.local_header_offset as i64), Some((entry.local_header_offset + 30) as i64))
            .map_err(|e| ContainerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        if header.len() < 30 || u32::from_le_bytes(header[0..4].try_into().unwrap()) != LOCAL_FILE_HEADER_SIG {
            return Err(ContainerError::Malformed(format!("bad local file header for {name}")));
        }
        let name_len = u16::from_le_bytes(header[26..28].try_into().unwrap()) as u64;
        let extra_len = u16::from_le_bytes(header[28..30].try_into().unwrap()) as u64;
        let data_start = entry.local_header_offset + 30 + name_len + extra_len;

        let end = end.unwrap_or(entry.uncompressed_size);
        if start > end || end > entry.uncompressed_size {
            return Err(ContainerError::Malformed(format!(
                "range [{start}, {end}) out of bounds for entry {name} of size {}",
                entry.uncompressed_size
            )));
        }

        self.chunker
            .read(Some((data_start + start) as i64), Some((data_start + end) as i64))
            .map_err(|e| ContainerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    pub fn entry_size(&self, name: &str) -> Result<u64, ContainerError> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.uncompressed_size)
            .ok_or_else(|| ContainerError::EntryNotFound(name.to_string()))
    }
}

fn find_eocd(tail: &[u8]) -> Option<usize> {
    if tail.len() < 22 {
        return None;
    }
    let sig = EOCD_SIG.to_le_bytes();
    (0..=tail.len() - 22).rev().find(|&i| tail[i..i + 4] == sig)
}

fn find_sig_before(tail: &[u8], before: usize, sig: u32) -> Option<usize> {
    let sig = sig.to_le_bytes();
    if before < 4 {
        return None;
    }
    (0..=before - 4).rev().find(|&i| tail[i..i + 4] == sig)
}

fn parse_eocd(eocd: &[u8]) -> Result<(u64, u64, u64), ContainerError> {
    if eocd.len() < 22 {
        return Err(ContainerError::Malformed("truncated EOCD record".to_string()));
    }
    let entry_count = u16::from_le_bytes(eocd[10..12].try_into().unwrap()) as u64;
    let central_dir_size = u32::from_le_bytes(eocd[12..16].try_into().unwrap()) as u64;
    let central_dir_start = u32::from_le_bytes(eocd[16..20].try_into().unwrap()) as u64;
    Ok((central_dir_start, central_dir_size, entry_count))
}

fn parse_central_directory(bytes: &[u8], entry_count: u64) -> Result<Vec<DirectoryEntry>, ContainerError> {
    let mut entries = Vec::with_capacity(entry_count as usize);
    let mut pos = 0usize;
    for _ in 0..entry_count {
        if pos + 46 > bytes.len() {
            return Err(ContainerError::Malformed("truncated central directory header".to_string()));
        }
        let sig = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        if sig != CENTRAL_DIR_HEADER_SIG {
            return Err(ContainerError::Malformed("bad central directory header signature".to_string()));
        }
        let name_len = u16::from_le_bytes(bytes[pos + 28..pos + 30].try_into().unwrap()) as usize;
        let extra_len = u16::from_le_bytes(bytes[pos + 30..pos + 32].try_into().unwrap()) as usize;
        let comment_len = u16::from_le_bytes(bytes[pos + 32..pos + 34].try_into().unwrap()) as usize;

        let mut uncompressed_size = u32::from_le_bytes(bytes[pos + 24..pos + 28].try_into().unwrap()) as u64;
        let mut local_header_offset = u32::from_le_bytes(bytes[pos + 42..pos + 46].try_into().unwrap()) as u64;

        let name_start = pos + 46;
        let name = String::from_utf8(bytes[name_start..name_start + name_len].to_vec())
            .map_err(|e| ContainerError::Malformed(format!("non-UTF8 entry name: {e}")))?;

        let extra_start = name_start + name_len;
        let extra = &bytes[extra_start..extra_start + extra_len];
        if uncompressed_size == 0xFFFF_FFFF || local_header_offset == 0xFFFF_FFFF {
            if let Some((u, _c, o)) = parse_zip64_extra(extra) {
                uncompressed_size = u;
                if let Some(o) = o {
                    local_header_offset = o;
                }
            }
        }

        entries.push(DirectoryEntry {
            name,
            uncompressed_size,
            local_header_offset,
        });

        pos = extra_start + extra_len + comment_len;
    }
    Ok(entries)
}

fn parse_zip64_extra(extra: &[u8]) -> Option<(u64, Option<u64>, Option<u64>)> {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let tag = u16::from_le_bytes(extra[pos..pos + 2].try_into().unwrap());
        let size = u16::from_le_bytes(extra[pos + 2..pos + 4].try_into().unwrap()) as usize;
        if tag == ZIP64_EXTRA_TAG {
            let field = &extra[pos + 4..pos + 4 + size];
            let uncompressed = u64::from_le_bytes(field[0..8].try_into().ok()?);
            let compressed = field.get(8..16).map(|b| u64::from_le_bytes(b.try_into().unwrap()));
            let offset = field.get(16..24).map(|b| u64::from_le_bytes(b.try_into().unwrap()));
            return Some((uncompressed, compressed, offset));
        }
        pos += 4 + size;
    }
    None
}
