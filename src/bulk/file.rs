//! Package file I/O: atomic NDJSON writes, gzip, and checksums.
//!
//! Writes go to a temp file, sync to disk, then rename over the target, so
//! a crashed export never leaves a torn file behind.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::entity::Row;
use crate::error::{Error, Result};

/// Hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write bytes atomically: temp file, fsync, rename.
///
/// # Errors
///
/// Returns an error if any file operation fails; the original file (if
/// any) is untouched on failure.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Serialize rows as NDJSON (optionally gzipped) and write atomically.
///
/// Returns the checksum and byte count of the file as written.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_rows(path: &Path, rows: &[Row], compress: bool) -> Result<(String, usize)> {
    let mut plain = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut plain, row)?;
        plain.push(b'\n');
    }
    let bytes = if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain)?;
        encoder.finish()?
    } else {
        plain
    };
    let checksum = sha256_hex(&bytes);
    let size = bytes.len();
    atomic_write(path, &bytes)?;
    Ok((checksum, size))
}

/// Read NDJSON rows, transparently decompressing `.gz` files.
///
/// # Errors
///
/// Returns an error when the file is missing or a line fails to parse.
pub fn read_rows(path: &Path) -> Result<Vec<Row>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|e| e == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let reader = BufReader::new(reader);

    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

/// Verify a file against its manifest checksum.
///
/// # Errors
///
/// Fails with a checksum mismatch when the content differs.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let bytes = fs::read(path)?;
    let actual = sha256_hex(&bytes);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            file: path.display().to_string(),
        })
    }
}

/// Write a JSON document atomically.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

/// Read a JSON document.
///
/// # Errors
///
/// Returns an error when the file is missing or malformed.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
