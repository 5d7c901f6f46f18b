//! Media type detection from byte signatures.
//!
//! Uploaded files carry whatever MIME type the client claimed; the pipeline
//! only trusts the bytes. Checks run in a fixed order and the first match
//! wins, so a RIFF container is reported as WebP regardless of its payload.

/// Number of leading bytes inspected for a null byte when deciding
/// whether unknown content is plain text.
const TEXT_SNIFF_LEN: usize = 500;

const PDF_MAGIC: &[u8] = b"%PDF";
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const RIFF_MAGIC: &[u8] = b"RIFF";

/// Media types the sniffer can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Pdf,
    Png,
    Jpeg,
    Webp,
    PlainText,
}

impl MediaType {
    pub fn as_mime(&self) -> &'static str {
        match self {
            MediaType::Pdf => "application/pdf",
            MediaType::Png => "image/png",
            MediaType::Jpeg => "image/jpeg",
            MediaType::Webp => "image/webp",
            MediaType::PlainText => "text/plain",
        }
    }
}

/// Infer a media type from the leading bytes of a file.
///
/// Input shorter than a signature simply fails to match it. Content with no
/// null byte in its first 500 bytes (including empty input) is plain text;
/// anything else falls back to PDF.
pub fn sniff_media_type(bytes: &[u8]) -> MediaType {
    if bytes.starts_with(PDF_MAGIC) {
        return MediaType::Pdf;
    }
    if bytes.starts_with(PNG_MAGIC) {
        return MediaType::Png;
    }
    if bytes.starts_with(JPEG_MAGIC) {
        return MediaType::Jpeg;
    }
    if bytes.starts_with(RIFF_MAGIC) {
        return MediaType::Webp;
    }

    let head = &bytes[..bytes.len().min(TEXT_SNIFF_LEN)];
    if !head.contains(&0) {
        return MediaType::PlainText;
    }

    MediaType::Pdf
}
