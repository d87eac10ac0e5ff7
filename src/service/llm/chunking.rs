//! Markdown chunking for LLM processing.
//!
//! Documents split on `##` headers first so each chunk stays semantically
//! coherent; oversized sections fall back to paragraph and finally word
//! splits. Token counts are approximated as chars/4.

/// A chunk handed to the extractor, with its position and the header
/// breadcrumb leading into it.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub content: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub header_path: Vec<String>,
}

/// Approximate token count (4 chars per token for English).
pub fn count_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Split markdown into chunks of at most `max_tokens`, optionally
/// prepending the paragraph-aligned tail of the previous chunk.
pub fn chunk_document(
    markdown: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<DocumentChunk> {
    if markdown.trim().is_empty() {
        return Vec::new();
    }

    let sections = split_by_headers(markdown);

    // Short single-section documents become one chunk.
    if sections.len() == 1 && count_tokens(&sections[0]) <= max_tokens {
        let content = sections[0].trim().to_string();
        let header_path = extract_header_path(&content);
        return vec![DocumentChunk {
            content,
            chunk_index: 0,
            total_chunks: 1,
            header_path,
        }];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0;

    for section in &sections {
        let section_tokens = count_tokens(section);

        if current_tokens + section_tokens <= max_tokens {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(section);
            current_tokens += section_tokens;
        } else if section_tokens > max_tokens {
            if !current.is_empty() {
                chunks.push(current.trim().to_string());
                current.clear();
                current_tokens = 0;
            }
            chunks.extend(split_large_section(section, max_tokens));
        } else {
            if !current.is_empty() {
                chunks.push(current.trim().to_string());
            }
            current = section.clone();
            current_tokens = section_tokens;
        }
    }

    if !current.is_empty() {
        chunks.push(current.trim().to_string());
    }

    if overlap_tokens > 0 && chunks.len() > 1 {
        let mut overlapped = Vec::with_capacity(chunks.len());
        overlapped.push(chunks[0].clone());
        for i in 1..chunks.len() {
            let tail = tail_text(&chunks[i - 1], overlap_tokens);
            if tail.is_empty() {
                overlapped.push(chunks[i].clone());
            } else {
                overlapped.push(format!("{}\n\n{}", tail, chunks[i]));
            }
        }
        chunks = overlapped;
    }

    let total_chunks = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(chunk_index, content)| {
            let header_path = extract_header_path(&content);
            DocumentChunk {
                content,
                chunk_index,
                total_chunks,
                header_path,
            }
        })
        .collect()
}

/// Split on `## ` headers (exactly H2), keeping each header with its body.
/// Preamble before the first header merges into the following section.
fn split_by_headers(markdown: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in markdown.lines() {
        if line.starts_with("## ") && !current.trim().is_empty() {
            sections.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current.trim().to_string());
    }

    // Preamble with no header folds into the first real section.
    if sections.len() > 1 && !sections[0].starts_with("## ") {
        let first = sections.remove(0);
        sections[0] = format!("{}\n\n{}", first, sections[0]);
    }

    sections
}

/// H1 -> H2 -> H3 breadcrumb at the end of the given markdown.
pub fn extract_header_path(markdown: &str) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();

    for line in markdown.lines() {
        let line = line.trim();
        if let Some(h1) = heading_text(line, 1) {
            headers = vec![h1];
        } else if let Some(h2) = heading_text(line, 2) {
            headers.truncate(1);
            headers.push(h2);
        } else if let Some(h3) = heading_text(line, 3) {
            headers.truncate(2);
            headers.push(h3);
        }
    }

    headers
}

fn heading_text(line: &str, level: usize) -> Option<String> {
    let prefix = "#".repeat(level) + " ";
    if line.starts_with(&prefix) && !line.starts_with(&("#".repeat(level + 1))) {
        Some(line[prefix.len()..].trim().to_string())
    } else {
        None
    }
}

/// Split an oversized section by paragraphs, re-applying its header to each
/// sub-chunk; paragraphs that alone exceed the budget split by words.
fn split_large_section(section: &str, max_tokens: usize) -> Vec<String> {
    let (header, content) = match section.lines().next() {
        Some(first) if first.starts_with('#') => {
            let body = section[first.len()..].trim_start_matches('\n');
            (format!("{}\n", first), body.to_string())
        }
        _ => (String::new(), section.to_string()),
    };

    let adjusted_max = if header.is_empty() {
        max_tokens
    } else {
        let header_tokens = count_tokens(&header);
        max_tokens.saturating_sub(header_tokens).max(max_tokens / 2)
    };

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0;

    let push_chunk = |chunks: &mut Vec<String>, body: &str| {
        if header.is_empty() {
            chunks.push(body.trim().to_string());
        } else {
            chunks.push(format!("{}{}", header, body).trim().to_string());
        }
    };

    for para in content.split("\n\n") {
        if para.trim().is_empty() {
            continue;
        }
        let para_tokens = count_tokens(para);

        if para_tokens > adjusted_max {
            if !current.is_empty() {
                push_chunk(&mut chunks, &current);
                current.clear();
                current_tokens = 0;
            }

            let mut word_chunk = String::new();
            for word in para.split_whitespace() {
                let candidate_len = word_chunk.len() + word.len() + 1 + header.len();
                if candidate_len / 4 <= max_tokens {
                    word_chunk.push_str(word);
                    word_chunk.push(' ');
                } else {
                    if !word_chunk.is_empty() {
                        push_chunk(&mut chunks, &word_chunk);
                    }
                    word_chunk = format!("{} ", word);
                }
            }
            if !word_chunk.is_empty() {
                push_chunk(&mut chunks, &word_chunk);
            }
        } else if current_tokens + para_tokens <= adjusted_max {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
            current_tokens += para_tokens;
        } else {
            if !current.is_empty() {
                push_chunk(&mut chunks, &current);
            }
            current = para.to_string();
            current_tokens = para_tokens;
        }
    }

    if !current.is_empty() {
        push_chunk(&mut chunks, &current);
    }

    if chunks.is_empty() {
        vec![section.to_string()]
    } else {
        chunks
    }
}

/// Whole trailing paragraphs of `text` fitting roughly `target_tokens`.
/// Returns at least one paragraph when any exist and the budget is > 0.
fn tail_text(text: &str, target_tokens: usize) -> String {
    if text.trim().is_empty() || target_tokens == 0 {
        return String::new();
    }

    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .collect();
    if paragraphs.is_empty() {
        return String::new();
    }

    let mut collected: Vec<&str> = Vec::new();
    let mut total = 0;
    for para in paragraphs.iter().rev() {
        let para_tokens = count_tokens(para);
        if total + para_tokens > target_tokens && !collected.is_empty() {
            break;
        }
        collected.push(para);
        total += para_tokens;
    }

    collected.reverse();
    collected.join("\n\n")
}
