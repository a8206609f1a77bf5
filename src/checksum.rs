//! MD5 content digests for document files
//!
//! Every version of a document in the object store is tagged with the MD5 of
//! its bytes; the worker directory holds the authoritative digest per doc.
//! Digests are rendered as lowercase hex with no prefix, matching the
//! `-hash` sidecar file format.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Computes the MD5 digest of a byte slice.
///
/// Deterministic: the same input always produces the same output.
pub fn compute_checksum(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Computes the MD5 digest of an entire file.
///
/// Reads the file in chunks to handle large documents without loading them
/// into memory.
///
/// # Errors
///
/// Returns `std::io::Error` if the file cannot be read.
pub fn compute_file_checksum(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;

    let mut reader = BufReader::new(file);
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        context.consume(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Checks whether a string is a plausible hex MD5 digest.
pub fn is_checksum(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}
