//! Sliding-window text chunker.
//!
//! Splits redacted document text into fixed-size character windows that
//! overlap by a configurable amount, so that a sentence cut at one window
//! boundary still appears whole in the neighbouring window.
//!
//! Windows are measured in Unicode scalar values, never bytes, so a chunk
//! boundary cannot split a multi-byte character.

use thiserror::Error;

/// Invalid chunking parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be > 0")]
    ZeroSize,

    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

/// Split `text` into windows of `size` characters whose start advances by
/// `size - overlap` each step.
///
/// The final window may be shorter than `size`. Empty input yields no
/// windows. `overlap >= size` would never advance and is rejected.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Result<Vec<String>, ChunkError> {
    if size == 0 {
        return Err(ChunkError::ZeroSize);
    }
    if overlap >= size {
        return Err(ChunkError::OverlapTooLarge { size, overlap });
    }

    // Byte offset of every char boundary, plus the end of the string.
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let char_len = bounds.len();
    bounds.push(text.len());

    let stride = size - overlap;
    let mut chunks = Vec::with_capacity(char_len.div_ceil(stride));
    let mut start = 0;

    while start < char_len {
        let end = (start + size).min(char_len);
        chunks.push(text[bounds[start]..bounds[end]].to_string());
        start += stride;
    }

    Ok(chunks)
}
