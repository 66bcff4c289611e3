//! Document splitting.
//!
//! A closed set of strategies selected by config. All strategies are
//! deterministic: identical input and config produce byte-identical output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::config::ChunkingConfig;
use crate::types;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").expect("heading regex is valid"));

static SENTENCE_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+\s+").expect("sentence break regex is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    BySize,
    BySentences,
    ByParagraphs,
    ByHeadings,
}

/// One split piece before it becomes a stored chunk. `chunk_index` is the
/// position within the document; `content_hash` covers the NFC-normalized,
/// trimmed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub chunk_index: u32,
    pub content: String,
    pub title: Option<String>,
    pub title_chain: Option<String>,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    strategy: ChunkStrategy,
    max_chunk_size: usize,
    overlap: usize,
}

/// Intermediate section before index/hash assignment.
struct Section {
    content: String,
    title: Option<String>,
    title_chain: Option<String>,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            strategy: config.strategy,
            max_chunk_size: config.max_chunk_size,
            overlap: config.overlap,
        }
    }

    /// Split `text` into ordered chunks. `name` (usually the document name)
    /// roots the title chain of heading-derived chunks.
    pub fn split(&self, text: &str, name: Option<&str>) -> Vec<ChunkPiece> {
        let sections = match self.strategy {
            ChunkStrategy::BySize => self.split_by_size(text),
            ChunkStrategy::BySentences => self.split_by_sentences(text),
            ChunkStrategy::ByParagraphs => self.split_by_paragraphs(text),
            ChunkStrategy::ByHeadings => self.split_by_headings(text, name),
        };

        sections
            .into_iter()
            .filter(|s| !s.content.trim().is_empty())
            .enumerate()
            .map(|(i, s)| ChunkPiece {
                chunk_index: i as u32,
                content_hash: normalized_hash(&s.content),
                content: s.content,
                title: s.title,
                title_chain: s.title_chain,
            })
            .collect()
    }

    fn split_by_size(&self, text: &str) -> Vec<Section> {
        self.window(text)
            .into_iter()
            .map(|content| Section {
                content,
                title: None,
                title_chain: None,
            })
            .collect()
    }

    fn split_by_paragraphs(&self, text: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut current = String::new();

        for paragraph in text.split("\n\n") {
            if paragraph.trim().is_empty() {
                continue;
            }
            if paragraph.len() > self.max_chunk_size {
                // Oversize paragraph: flush what we have, then window it.
                if !current.is_empty() {
                    sections.push(plain(std::mem::take(&mut current)));
                }
                sections.extend(self.window(paragraph).into_iter().map(plain));
                continue;
            }
            if !current.is_empty() && current.len() + 2 + paragraph.len() > self.max_chunk_size {
                sections.push(plain(std::mem::take(&mut current)));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
        }
        if !current.is_empty() {
            sections.push(plain(current));
        }
        sections
    }

    fn split_by_sentences(&self, text: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut current = String::new();

        for sentence in split_sentences(text) {
            if sentence.trim().is_empty() {
                continue;
            }
            if sentence.len() > self.max_chunk_size {
                if !current.is_empty() {
                    sections.push(plain(std::mem::take(&mut current)));
                }
                sections.extend(self.window(sentence).into_iter().map(plain));
                continue;
            }
            if !current.is_empty() && current.len() + sentence.len() > self.max_chunk_size {
                sections.push(plain(std::mem::take(&mut current)));
            }
            current.push_str(sentence);
        }
        if !current.is_empty() {
            sections.push(plain(current));
        }
        sections
    }

    /// One chunk per heading-delimited section; oversize sections are windowed
    /// under the heading's title context. The title chain walks the heading
    /// stack (rooted at the document name when given), e.g. "Guide > Setup".
    fn split_by_headings(&self, text: &str, name: Option<&str>) -> Vec<Section> {
        let mut sections = Vec::new();
        // (level, title) stack of open headings.
        let mut stack: Vec<(usize, String)> = Vec::new();
        let mut body = String::new();

        let flush = |stack: &[(usize, String)], body: &mut String, out: &mut Vec<Section>| {
            let content = body.trim();
            if !content.is_empty() {
                let title = stack.last().map(|(_, t)| t.clone());
                let chain = title_chain(name, stack);
                if content.len() > self.max_chunk_size {
                    for piece in self.window(content) {
                        out.push(Section {
                            content: piece,
                            title: title.clone(),
                            title_chain: chain.clone(),
                        });
                    }
                } else {
                    out.push(Section {
                        content: content.to_string(),
                        title,
                        title_chain: chain,
                    });
                }
            }
            body.clear();
        };

        for line in text.lines() {
            if let Some(caps) = HEADING_RE.captures(line) {
                flush(&stack, &mut body, &mut sections);
                let level = caps[1].len();
                let title = caps[2].to_string();
                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, title));
            } else {
                body.push_str(line);
                body.push('\n');
            }
        }
        flush(&stack, &mut body, &mut sections);
        sections
    }

    /// Sliding window with overlap. Cut points prefer paragraph, sentence,
    /// line and word breaks near the window end, and always land on char
    /// boundaries. Consecutive windows share exactly `overlap` bytes except
    /// where boundary snapping shifts the start.
    fn window(&self, text: &str) -> Vec<String> {
        if text.len() <= self.max_chunk_size {
            return vec![text.to_string()];
        }

        let mut out = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let raw_end = (start + self.max_chunk_size).min(text.len());
            let end = snap_to_char_boundary(text, raw_end);

            let actual_end = if end < text.len() {
                let candidate = self.find_break_point(text, start, end);
                if candidate > start {
                    candidate
                } else {
                    end
                }
            } else {
                end
            };

            let piece = &text[start..actual_end];
            if !piece.trim().is_empty() {
                out.push(piece.to_string());
            }

            if actual_end >= text.len() {
                break;
            }

            let step = if actual_end - start > self.overlap {
                actual_end - start - self.overlap
            } else {
                actual_end - start
            };
            let mut next = snap_to_char_boundary(text, start + step.max(1));
            if next <= start {
                // Boundary snapping must not stall the window.
                next = start
                    + text[start..]
                        .chars()
                        .next()
                        .map(char::len_utf8)
                        .unwrap_or(1);
            }
            start = next;
        }

        out
    }

    fn find_break_point(&self, text: &str, start: usize, preferred_end: usize) -> usize {
        let raw_search_start = if preferred_end > start + 200 {
            preferred_end - 200
        } else {
            start
        };
        let search_start = snap_to_char_boundary(text, raw_search_start);
        let safe_end = snap_to_char_boundary(text, preferred_end);

        if search_start >= safe_end {
            return safe_end;
        }

        let search_region = &text[search_start..safe_end];

        // Priority: paragraph break > sentence end > line break > word break
        if let Some(pos) = search_region.rfind("\n\n") {
            return search_start + pos + 2;
        }
        if let Some(pos) = search_region.rfind(". ") {
            return search_start + pos + 2;
        }
        if let Some(pos) = search_region.rfind(".\n") {
            return search_start + pos + 2;
        }
        if let Some(pos) = search_region.rfind('\n') {
            return search_start + pos + 1;
        }
        if let Some(pos) = search_region.rfind(' ') {
            return search_start + pos + 1;
        }

        safe_end
    }
}

fn plain(content: String) -> Section {
    Section {
        content,
        title: None,
        title_chain: None,
    }
}

fn title_chain(name: Option<&str>, stack: &[(usize, String)]) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(n) = name {
        if !n.trim().is_empty() {
            parts.push(n);
        }
    }
    parts.extend(stack.iter().map(|(_, t)| t.as_str()));
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" > "))
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in SENTENCE_BREAK_RE.find_iter(text) {
        out.push(&text[start..m.end()]);
        start = m.end();
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Stable hash of the normalized (trimmed, unicode-NFC) chunk text.
fn normalized_hash(text: &str) -> String {
    let normalized: String = text.trim().nfc().collect();
    types::content_hash(&normalized)
}

/// Snap a byte offset to the nearest valid UTF-8 char boundary (rounding down).
fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}
