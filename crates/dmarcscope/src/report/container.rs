//! Report container detection and decompression.
//!
//! Reporters send the XML plain, gzipped, or as a single-member zip archive.
//! The kind is sniffed from magic bytes first; the filename/content-type hint
//! only matters when the payload carries no recognizable signature.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use tracing::debug;

use super::error::ParseError;

/// Upper bound for decompressed report XML.
pub const MAX_DECOMPRESSED_BYTES: u64 = 64 * 1024 * 1024;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Xml,
    Gzip,
    Zip,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Xml => "xml",
            ContainerKind::Gzip => "gzip",
            ContainerKind::Zip => "zip",
        }
    }

    /// Guesses the kind from a filename extension.
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ContainerKind::Zip)
        } else if lower.ends_with(".gz") || lower.ends_with(".gzip") {
            Some(ContainerKind::Gzip)
        } else if lower.ends_with(".xml") {
            Some(ContainerKind::Xml)
        } else {
            None
        }
    }

    /// Guesses the kind from a MIME type such as `application/gzip`.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let base = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match base.as_str() {
            "application/zip" | "application/x-zip-compressed" | "application/x-zip" => {
                Some(ContainerKind::Zip)
            }
            "application/gzip" | "application/x-gzip" | "application/x-gunzip" => {
                Some(ContainerKind::Gzip)
            }
            "text/xml" | "application/xml" => Some(ContainerKind::Xml),
            _ => None,
        }
    }

    /// Detects the kind from the payload's leading bytes.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(GZIP_MAGIC) {
            Some(ContainerKind::Gzip)
        } else if data.starts_with(ZIP_MAGIC) {
            Some(ContainerKind::Zip)
        } else if looks_like_xml(data) {
            Some(ContainerKind::Xml)
        } else {
            None
        }
    }
}

fn looks_like_xml(data: &[u8]) -> bool {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    data.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

/// Unwraps the container and returns the report XML bytes.
pub fn decode_container(data: &[u8], hint: Option<ContainerKind>) -> Result<Vec<u8>, ParseError> {
    if data.is_empty() {
        return Err(ParseError::Empty);
    }

    let kind = ContainerKind::sniff(data)
        .or(hint)
        .unwrap_or(ContainerKind::Xml);
    debug!(kind = kind.as_str(), bytes = data.len(), "Decoding report container");

    let xml = match kind {
        ContainerKind::Xml => data.to_vec(),
        ContainerKind::Gzip => read_capped(GzDecoder::new(data), "gzip")?,
        ContainerKind::Zip => extract_zip(data)?,
    };

    if xml.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(xml)
}

fn extract_zip(data: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(data)).map_err(|e| ParseError::Container {
            kind: "zip",
            reason: e.to_string(),
        })?;

    for index in 0..archive.len() {
        let member = archive.by_index(index).map_err(|e| ParseError::Container {
            kind: "zip",
            reason: e.to_string(),
        })?;
        if member.is_dir() || !member.name().to_ascii_lowercase().ends_with(".xml") {
            continue;
        }
        debug!(member = member.name(), "Using zip member as report");
        return read_capped(member, "zip");
    }

    Err(ParseError::NoXmlMember)
}

fn read_capped<R: Read>(reader: R, kind: &'static str) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::new();
    reader
        .take(MAX_DECOMPRESSED_BYTES + 1)
        .read_to_end(&mut out)
        .map_err(|e| ParseError::Container {
            kind,
            reason: e.to_string(),
        })?;

    if out.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(ParseError::TooLarge {
            limit: MAX_DECOMPRESSED_BYTES,
        });
    }
    Ok(out)
}
