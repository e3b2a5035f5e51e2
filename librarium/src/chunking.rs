use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Chunking strategy selection.
///
/// `Paragraph` is the default: it keeps semantically coherent blocks together
/// and degrades gracefully (oversized paragraphs are re-split by sentence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Fixed,
    Sentence,
    Paragraph,
    Semantic,
}

impl std::str::FromStr for ChunkStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(ChunkStrategy::Fixed),
            "sentence" => Ok(ChunkStrategy::Sentence),
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "semantic" => Ok(ChunkStrategy::Semantic),
            other => Err(anyhow::anyhow!("unknown chunk strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub strategy: ChunkStrategy,
    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Characters of continuity carried between adjacent chunks
    pub overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::Paragraph,
            chunk_size: 1000,
            overlap: 100,
        }
    }
}

/// A text segment with character offsets into the source text.
/// Invariant: `start_index <= end_index <= source char count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub content: String,
    pub start_index: usize,
    pub end_index: usize,
    pub length: usize,
}

/// A chunk bound to a document, ready for embedding and vector upsert.
/// The id is a freshly generated UUID, never derived from the parent id,
/// so it is always a valid vector-store point id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub start_index: usize,
    pub end_index: usize,
    pub metadata: serde_json::Value,
}

/// Split text into retrieval-sized chunks using the configured strategy.
///
/// All strategies emit contiguous character spans of the source text: each
/// chunk's content is exactly `text[start_index..end_index]` (in chars), and
/// adjacent chunks overlap by at most `options.overlap` characters with no
/// gaps between them.
pub fn chunk(text: &str, options: &ChunkOptions) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.iter().all(|c| c.is_whitespace()) {
        return Vec::new();
    }

    let size = options.chunk_size.max(1);
    let overlap = options.overlap.min(size.saturating_sub(1));

    let spans = match options.strategy {
        ChunkStrategy::Fixed => fixed_spans(chars.len(), size, overlap),
        ChunkStrategy::Sentence => pack_spans(&sentence_spans(&chars), size, overlap, 0),
        ChunkStrategy::Paragraph => paragraph_spans(&chars, size, overlap),
        ChunkStrategy::Semantic => semantic_spans(&chars, size, overlap),
    };

    spans
        .into_iter()
        .map(|(start, end)| TextChunk {
            content: chars[start..end].iter().collect(),
            start_index: start,
            end_index: end,
            length: end - start,
        })
        .collect()
}

/// Chunk a document's content and attach per-chunk identity and metadata.
pub fn chunk_document(
    document_id: &str,
    content: &str,
    base_metadata: &serde_json::Value,
    options: &ChunkOptions,
) -> Vec<DocumentChunk> {
    let chunks = chunk(content, options);
    let total = chunks.len();

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let mut metadata = base_metadata.clone();
            if let Some(map) = metadata.as_object_mut() {
                map.insert("chunk_length".to_string(), json!(c.length));
            }
            DocumentChunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                content: c.content,
                chunk_index: i,
                total_chunks: total,
                start_index: c.start_index,
                end_index: c.end_index,
                metadata,
            }
        })
        .collect()
}

/// Sliding window of `size` chars advancing by `size - overlap`.
fn fixed_spans(total: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let step = (size - overlap).max(1);
    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(total);
        spans.push((start, end));
        if end == total {
            break;
        }
        start += step;
    }
    spans
}

/// Split into sentence spans that tile the text exactly: each span ends
/// after its terminator run plus any following whitespace.
fn sentence_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            // Swallow terminator runs ("..." / "?!") and closing quotes
            while i + 1 < chars.len() && matches!(chars[i + 1], '.' | '!' | '?' | '"' | '\'' | ')') {
                i += 1;
            }
            let mut end = i + 1;
            while end < chars.len() && chars[end].is_whitespace() {
                end += 1;
            }
            spans.push((start, end));
            start = end;
            i = end;
        } else {
            i += 1;
        }
    }

    if start < chars.len() {
        spans.push((start, chars.len()));
    }
    spans
}

/// Split into paragraph spans on blank-line boundaries; spans include their
/// trailing blank lines so they tile the text.
fn blank_line_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        // A paragraph break is a newline followed by at least one more
        // newline with only horizontal whitespace in between.
        if chars[i] == '\n' {
            let mut j = i + 1;
            while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t' || chars[j] == '\r') {
                j += 1;
            }
            if j < chars.len() && chars[j] == '\n' {
                // Extend through the whole blank-line run
                let mut end = j + 1;
                while end < chars.len() && chars[end].is_whitespace() {
                    end += 1;
                }
                spans.push((start, end));
                start = end;
                i = end;
                continue;
            }
        }
        i += 1;
    }

    if start < chars.len() {
        spans.push((start, chars.len()));
    }
    spans
}

/// Greedily pack unit spans into chunks of at most `size` chars. A new chunk
/// is seeded with the last `overlap` chars of the previous one for
/// continuity. At depth 0, units larger than `size` are hard-cut into fixed
/// windows; deeper callers handle oversize themselves.
fn pack_spans(
    units: &[(usize, usize)],
    size: usize,
    overlap: usize,
    depth: usize,
) -> Vec<(usize, usize)> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for &(u_start, u_end) in units {
        let u_len = u_end - u_start;

        if u_len > size && depth == 0 {
            // Flush whatever is pending, then delegate the oversized unit
            if let Some(span) = current.take() {
                spans.push(span);
            }
            let inner: Vec<(usize, usize)> = spans_within(u_start, u_end, size, overlap);
            spans.extend(inner);
            continue;
        }

        match current {
            None => {
                // Seed with the previous chunk's tail when one exists
                let seeded_start = spans
                    .last()
                    .map(|&(_, prev_end)| prev_end.saturating_sub(overlap))
                    .unwrap_or(u_start);
                current = Some((seeded_start.min(u_start), u_end));
            }
            Some((c_start, c_end)) => {
                if u_end - c_start > size {
                    spans.push((c_start, c_end));
                    let seeded_start = c_end.saturating_sub(overlap);
                    current = Some((seeded_start.min(u_start), u_end));
                } else {
                    current = Some((c_start, u_end));
                }
            }
        }
    }

    if let Some(span) = current {
        spans.push(span);
    }
    spans
}

/// Hard-cut an oversized unit (a single sentence longer than the budget)
/// into fixed windows within its bounds.
fn spans_within(start: usize, end: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let step = (size - overlap).max(1);
    let mut s = start;
    loop {
        let e = (s + size).min(end);
        spans.push((s, e));
        if e == end {
            break;
        }
        s += step;
    }
    spans
}

fn paragraph_spans(chars: &[char], size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let paragraphs = blank_line_spans(chars);
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for &(p_start, p_end) in &paragraphs {
        let p_len = p_end - p_start;

        if p_len > size {
            if let Some(span) = current.take() {
                spans.push(span);
            }
            // A single paragraph over the budget is delegated to the
            // sentence strategy within its own bounds.
            let inner_sentences: Vec<(usize, usize)> = sentence_spans(&chars[p_start..p_end])
                .into_iter()
                .map(|(s, e)| (s + p_start, e + p_start))
                .collect();
            spans.extend(pack_spans(&inner_sentences, size, overlap, 1));
            continue;
        }

        match current {
            None => {
                let seeded_start = spans
                    .last()
                    .map(|&(_, prev_end)| prev_end.saturating_sub(overlap))
                    .unwrap_or(p_start);
                current = Some((seeded_start.min(p_start), p_end));
            }
            Some((c_start, c_end)) => {
                if p_end - c_start > size {
                    spans.push((c_start, c_end));
                    let seeded_start = c_end.saturating_sub(overlap);
                    current = Some((seeded_start.min(p_start), p_end));
                } else {
                    current = Some((c_start, p_end));
                }
            }
        }
    }

    if let Some(span) = current {
        spans.push(span);
    }
    spans
}

/// Header-aware chunking: text is segmented into units starting at
/// header-like lines, so each body keeps its most recent header as leading
/// context. Units are packed like paragraphs; oversized units fall back to
/// paragraph chunking within their bounds.
fn semantic_spans(chars: &[char], size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let line_starts = header_line_starts(chars);

    // Unit boundaries: start of text plus every header line start
    let mut boundaries = vec![0];
    for &pos in &line_starts {
        if pos != 0 {
            boundaries.push(pos);
        }
    }
    boundaries.push(chars.len());
    boundaries.dedup();

    let mut spans: Vec<(usize, usize)> = Vec::new();
    for window in boundaries.windows(2) {
        let (u_start, u_end) = (window[0], window[1]);
        if u_end <= u_start {
            continue;
        }
        if u_end - u_start > size {
            let inner = paragraph_spans(&chars[u_start..u_end], size, overlap)
                .into_iter()
                .map(|(s, e)| (s + u_start, e + u_start));
            spans.extend(inner);
        } else {
            spans.push((u_start, u_end));
        }
    }

    // Merge adjacent small units up to the budget (keeps header+body together)
    pack_spans(&spans, size, overlap, 1)
}

/// Char offsets of lines that look like section headers: markdown headers,
/// or short capitalized lines without terminal punctuation.
fn header_line_starts(chars: &[char]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut line_start = 0;

    let mut push_if_header = |line_start: usize, line_end: usize, starts: &mut Vec<usize>| {
        let line: String = chars[line_start..line_end].iter().collect();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let is_markdown = trimmed.starts_with('#');
        let is_caps_header = trimmed.len() < 60
            && trimmed.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
            && !trimmed.ends_with(['.', '!', '?', ',', ';', ':'])
            && trimmed.split_whitespace().count() <= 8;
        if is_markdown || is_caps_header {
            starts.push(line_start);
        }
    };

    for (i, &c) in chars.iter().enumerate() {
        if c == '\n' {
            push_if_header(line_start, i, &mut starts);
            line_start = i + 1;
        }
    }
    if line_start < chars.len() {
        push_if_header(line_start, chars.len(), &mut starts);
    }
    starts
}
