use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::models::Chunk;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be greater than zero".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than max_chars {}",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

impl From<&IngestConfig> for ChunkingConfig {
    fn from(value: &IngestConfig) -> Self {
        Self {
            max_chars: value.chunk_max_chars,
            overlap_chars: value.chunk_overlap_chars,
            min_chars: value.min_chunk_chars,
        }
    }
}

/// A slice of normalised page text, with offsets counted in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Collapses runs of whitespace inside paragraphs while keeping blank-line
/// paragraph breaks as `\n\n`.
pub fn normalize_page_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .split("\n\n")
        .map(|paragraph| {
            paragraph
                .replace('\u{a0}', " ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|paragraph| !paragraph.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn chunk_spans(normalized: &str, config: ChunkingConfig) -> Vec<TextSpan> {
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let mut packed: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (start, end) in paragraph_spans(&chars) {
        current = match current {
            None => Some((start, end)),
            Some((current_start, _)) if end - current_start <= config.max_chars => {
                Some((current_start, end))
            }
            Some(done) => {
                packed.push(done);
                Some((start, end))
            }
        };
    }
    packed.extend(current);

    let mut spans = Vec::new();
    for (start, end) in packed {
        if end - start <= config.max_chars {
            spans.push((start, end));
        } else {
            split_with_overlap(&chars, start, end, config, &mut spans);
        }
    }

    spans
        .into_iter()
        .map(|(start, end)| TextSpan {
            start,
            end,
            text: chars[start..end].iter().collect(),
        })
        .filter(|span| span.text.trim().chars().count() >= config.min_chars.max(1))
        .collect()
}

fn paragraph_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while index < chars.len() {
        if chars[index] == '\n' && chars.get(index + 1) == Some(&'\n') {
            if index > start {
                spans.push((start, index));
            }
            index += 2;
            start = index;
        } else {
            index += 1;
        }
    }
    if start < chars.len() {
        spans.push((start, chars.len()));
    }
    spans
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '。' | '．' | '！' | '？' | '.' | '!' | '?' | '\n')
}

fn split_with_overlap(
    chars: &[char],
    start: usize,
    end: usize,
    config: ChunkingConfig,
    out: &mut Vec<(usize, usize)>,
) {
    let mut cursor = start;
    while cursor < end {
        let hard_end = (cursor + config.max_chars).min(end);
        let cut = if hard_end == end {
            end
        } else {
            let earliest = cursor + config.max_chars / 2;
            (earliest..hard_end)
                .rev()
                .find(|&index| is_sentence_end(chars[index]))
                .map(|index| index + 1)
                .unwrap_or(hard_end)
        };

        out.push((cursor, cut));
        if cut >= end {
            break;
        }
        cursor = cut.saturating_sub(config.overlap_chars).max(cursor + 1);
    }
}

/// Chunks one page. Chunk ids depend only on the document, page, position and
/// text, so re-processing a page replaces its earlier chunks.
pub fn build_chunks(
    document_id: &str,
    source_name: &str,
    page: u32,
    page_text: &str,
    config: ChunkingConfig,
    tags: &BTreeSet<String>,
) -> Result<Vec<Chunk>, IngestError> {
    config.validate()?;
    let normalized = normalize_page_text(page_text);

    Ok(chunk_spans(&normalized, config)
        .into_iter()
        .enumerate()
        .map(|(index, span)| Chunk {
            chunk_id: make_chunk_id(document_id, page, index as u64, &span.text),
            document_id: document_id.to_string(),
            source_name: source_name.to_string(),
            page,
            chunk_index: index as u64,
            text: span.text,
            char_start: span.start,
            char_end: span.end,
            embedding: Vec::new(),
            tags: tags.clone(),
            note_topic: None,
        })
        .collect())
}

pub fn make_chunk_id(document_id: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
