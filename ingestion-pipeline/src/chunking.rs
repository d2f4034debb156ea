use common::storage::types::document::SourceType;

/// Separator ladder for the recursive splitter, peeled in order.
pub const RECURSIVE_SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitterKind {
    /// Prefers heading then paragraph boundaries, chunks within ±25% of target.
    Semantic,
    /// Separator-peeling splitter, chunks never exceed 1.5x target.
    Recursive,
}

/// Per-type chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkProfile {
    pub target: usize,
    pub overlap: usize,
    pub splitter: SplitterKind,
    /// Parent chunk size as a multiple of the child target.
    pub parent_window: Option<usize>,
}

pub fn profile_for(source_type: SourceType) -> ChunkProfile {
    match source_type {
        SourceType::Textbook => ChunkProfile {
            target: 1200,
            overlap: 300,
            splitter: SplitterKind::Semantic,
            parent_window: Some(3),
        },
        SourceType::Paper => ChunkProfile {
            target: 800,
            overlap: 200,
            splitter: SplitterKind::Recursive,
            parent_window: Some(2),
        },
        SourceType::Notes => ChunkProfile {
            target: 600,
            overlap: 100,
            splitter: SplitterKind::Recursive,
            parent_window: None,
        },
        SourceType::Code => ChunkProfile {
            target: 1000,
            overlap: 150,
            splitter: SplitterKind::Recursive,
            parent_window: None,
        },
        SourceType::General => ChunkProfile {
            target: 1000,
            overlap: 200,
            splitter: SplitterKind::Recursive,
            parent_window: Some(2),
        },
    }
}

/// A chunk before persistence: text plus extracted locators and an optional
/// back-reference into the parent list.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftChunk {
    pub text: String,
    pub page: Option<u32>,
    pub section_title: Option<String>,
    pub parent_index: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkingOutput {
    pub children: Vec<DraftChunk>,
    pub parents: Vec<String>,
}

/// Splits a document according to its type profile. When the profile has a
/// parent window, parents are cut first and each parent is split into the
/// retrieval children; otherwise the children are cut directly.
pub fn chunk_document(text: &str, source_type: SourceType) -> ChunkingOutput {
    let profile = profile_for(source_type);

    match profile.parent_window {
        Some(window) => {
            let parent_target = profile.target * window.max(1);
            let parents = split_by(profile.splitter, text, parent_target);

            let mut children = Vec::new();
            let mut kept_parents = Vec::with_capacity(parents.len());
            for parent_text in parents {
                let clean_parent = clean_text(&parent_text);
                if clean_parent.is_empty() {
                    continue;
                }
                let parent_index = kept_parents.len();

                let slices =
                    apply_overlap(split_by(profile.splitter, &parent_text, profile.target), profile.overlap);
                for slice in slices {
                    if let Some(draft) = draft_chunk(&slice, Some(parent_index)) {
                        children.push(draft);
                    }
                }

                kept_parents.push(clean_parent);
            }

            ChunkingOutput {
                children,
                parents: kept_parents,
            }
        }
        None => {
            let slices = apply_overlap(split_by(profile.splitter, text, profile.target), profile.overlap);
            let children = slices
                .iter()
                .filter_map(|slice| draft_chunk(slice, None))
                .collect();

            ChunkingOutput {
                children,
                parents: Vec::new(),
            }
        }
    }
}

fn split_by(splitter: SplitterKind, text: &str, target: usize) -> Vec<String> {
    match splitter {
        SplitterKind::Semantic => semantic_split(text, target),
        SplitterKind::Recursive => recursive_split(text, target),
    }
}

/// Separator-peeling splitter. Pieces pack up to the target; anything still
/// over 1.5x target falls through to the next separator, and finally to a
/// hard character cut.
pub fn recursive_split(text: &str, target: usize) -> Vec<String> {
    let target = target.max(1);
    let max = target + target / 2;
    let mut chunks = split_with(text, target, max, &RECURSIVE_SEPARATORS);
    chunks.retain(|chunk| !chunk.trim().is_empty());
    chunks
}

fn split_with(text: &str, target: usize, max: usize, separators: &[&str]) -> Vec<String> {
    if text.len() <= max {
        return vec![text.to_string()];
    }

    let Some((separator, rest)) = separators.split_first() else {
        return hard_cut(text, target);
    };

    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in text.split_inclusive(separator) {
        if piece.len() > max {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.extend(split_with(piece, target, max, rest));
            continue;
        }

        if !current.is_empty() && current.len() + piece.len() > target {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(piece);
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

fn hard_cut(text: &str, target: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + target).min(text.len());
        while end < text.len() && !text.is_char_boundary(end) {
            end += 1;
        }
        chunks.push(text[start..end].to_string());
        start = end;
    }

    chunks
}

/// Heading-first packing: a chunk closes at a heading once it reached 75% of
/// target, or whenever the next paragraph would push it past 125%.
pub fn semantic_split(text: &str, target: usize) -> Vec<String> {
    let target = target.max(1);
    let min = target * 3 / 4;
    let max = target + target / 4;

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        if paragraph.trim().is_empty() {
            continue;
        }

        if paragraph.len() > max {
            if !current.trim().is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.extend(recursive_split(paragraph, target));
            continue;
        }

        let at_heading = paragraph.trim_start().starts_with('#');
        let would_overflow = !current.is_empty() && current.len() + paragraph.len() + 2 > max;
        let heading_break = at_heading && current.len() >= min;

        if would_overflow || heading_break {
            chunks.push(std::mem::take(&mut current));
        }

        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Prepends the tail of each chunk to its successor. Sentences the successor
/// already opens with are not repeated.
pub fn apply_overlap(chunks: Vec<String>, overlap: usize) -> Vec<String> {
    if overlap == 0 || chunks.len() < 2 {
        return chunks;
    }

    let mut result: Vec<String> = Vec::with_capacity(chunks.len());

    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            result.push(chunk.clone());
            continue;
        }

        let tail = overlap_tail(&chunks[i - 1], overlap);
        if tail.is_empty() || chunk.starts_with(&tail) {
            result.push(chunk.clone());
        } else {
            result.push(format!("{tail} {chunk}", chunk = chunk.trim_start()));
        }
    }

    result
}

fn overlap_tail(text: &str, overlap: usize) -> String {
    // A chunk shorter than the overlap would be repeated wholesale; skip it.
    if text.len() <= overlap {
        return String::new();
    }

    let mut start = text.len() - overlap;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }

    // Begin at a word boundary.
    if let Some(pos) = text[start..].find(char::is_whitespace) {
        start += pos + 1;
    }

    text[start..].trim().to_string()
}

fn draft_chunk(slice: &str, parent_index: Option<usize>) -> Option<DraftChunk> {
    let page = extract_page(slice);
    let section_title = extract_section(slice);
    let text = clean_text(slice);

    if text.is_empty() {
        return None;
    }

    Some(DraftChunk {
        text,
        page,
        section_title,
        parent_index,
    })
}

/// First `[PAGE n]` marker in the slice, if any.
pub fn extract_page(text: &str) -> Option<u32> {
    let mut search = text;
    while let Some(pos) = search.find("[PAGE ") {
        let rest = &search[pos + "[PAGE ".len()..];
        if let Some(end) = rest.find(']') {
            if let Ok(page) = rest[..end].trim().parse::<u32>() {
                return Some(page);
            }
        }
        search = rest;
    }
    None
}

/// First markdown heading in the slice, if any.
pub fn extract_section(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            let title = trimmed.trim_start_matches('#').trim();
            if title.is_empty() {
                None
            } else {
                Some(title.to_string())
            }
        } else {
            None
        }
    })
}

fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    // Page markers were extracted into metadata; drop them from the body.
    while let Some(pos) = rest.find("[PAGE ") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos..];
        match after.find(']') {
            Some(end) => rest = &after[end + 1..],
            None => {
                rest = "";
                out.push_str(after);
            }
        }
    }
    out.push_str(rest);

    out.trim().to_string()
}
