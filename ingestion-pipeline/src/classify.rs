use common::storage::types::document::SourceType;

/// Deterministic structural classifier for uploaded documents.
///
/// Scores each candidate type from text signals plus title hints; ties
/// resolve in the order textbook, paper, notes, code, general.
pub fn classify_document(text: &str, title: &str) -> SourceType {
    if text.trim().len() < 50 {
        return SourceType::General;
    }

    let lower = text.to_lowercase();
    let lines: Vec<&str> = text.lines().collect();
    let total_lines = lines.len().max(1);
    let word_count = text.split_whitespace().count();

    let mut textbook = 0i32;
    let mut paper = 0i32;
    let mut notes = 0i32;
    let mut code = 0i32;

    // Textbook signals: chapter/section numbering and sheer size.
    if contains_word_before_digit(&lower, "chapter") {
        textbook += 3;
    }
    for marker in ["definition", "theorem", "lemma", "proof", "corollary"] {
        if lower.contains(marker) {
            textbook += 1;
            break;
        }
    }
    if contains_word_before_digit(&lower, "section") {
        textbook += 1;
    }
    if word_count > 10_000 {
        textbook += 2;
    }

    // Paper signals: abstract up front, references at the back.
    let head = char_prefix(&lower, 2000);
    let tail = char_suffix(&lower, 3000);
    if head.contains("abstract") {
        paper += 3;
    }
    if head.contains("introduction") {
        paper += 1;
    }
    if tail.contains("references") {
        paper += 2;
    }
    for marker in ["et al.", "proceedings", "journal", "conference"] {
        if lower.contains(marker) {
            paper += 1;
            break;
        }
    }

    // Code signals: fence density and source-looking lines.
    let fence_count = text.matches("```").count();
    if fence_count >= 4 {
        code += 3;
    } else if fence_count >= 2 {
        code += 1;
    }
    let code_lines = lines
        .iter()
        .filter(|line| {
            let t = line.trim_start();
            t.starts_with("def ")
                || t.starts_with("fn ")
                || t.starts_with("class ")
                || t.starts_with("import ")
                || t.starts_with("from ")
                || t.starts_with("#include")
                || t.starts_with("//")
        })
        .count();
    if code_lines as f32 / total_lines as f32 > 0.2 {
        code += 3;
    }

    // Notes signals: bullet-heavy and short.
    let bullet_lines = lines
        .iter()
        .filter(|line| {
            let t = line.trim_start();
            t.starts_with("- ") || t.starts_with("* ") || t.starts_with("• ")
        })
        .count();
    if bullet_lines as f32 / total_lines as f32 > 0.3 {
        notes += 2;
    }
    if word_count < 3000 {
        notes += 1;
    }

    // Title hints, including filename extensions.
    let title_lower = title.to_lowercase();
    for ext in [".py", ".rs", ".c", ".cpp", ".js", ".ts", ".java", ".go"] {
        if title_lower.ends_with(ext) {
            code += 2;
        }
    }
    for hint in ["textbook", "book", "chapter"] {
        if title_lower.contains(hint) {
            textbook += 2;
        }
    }
    for hint in ["paper", "arxiv"] {
        if title_lower.contains(hint) {
            paper += 2;
        }
    }
    if title_lower.contains("notes") {
        notes += 2;
    }

    // A single weak signal is not enough to leave the general profile.
    let best = textbook.max(paper).max(notes).max(code);
    if best <= 1 {
        return SourceType::General;
    }

    // Tie-break in declaration order.
    if textbook == best {
        SourceType::Textbook
    } else if paper == best {
        SourceType::Paper
    } else if notes == best {
        SourceType::Notes
    } else {
        SourceType::Code
    }
}

fn char_prefix(text: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn char_suffix(text: &str, max_bytes: usize) -> &str {
    let mut start = text.len().saturating_sub(max_bytes);
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn contains_word_before_digit(haystack: &str, word: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let after = start + pos + word.len();
        let rest = haystack[after..].trim_start();
        if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return true;
        }
        start = after;
    }
    false
}
