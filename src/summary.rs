//! Extractive fallback summarizer.
//!
//! Used when the generation provider fails or returns a blank answer. It
//! selects complete sentences from the retrieved documents, in retrieval
//! order, and groups them into short paragraphs:
//!
//! 1. Keep document texts longer than 20 characters (after trimming); use
//!    the first 5, joined with single spaces.
//! 2. Split into sentences after `.`, `!` or `?` followed by whitespace.
//! 3. Keep sentences longer than 30 characters that end in `.`, `!` or `?`.
//!    If none survive, return the first kept document cut to 1000 characters.
//! 4. Take up to 15 sentences. A paragraph is closed once it holds at least
//!    3 sentences and either the sentence is the last one or the paragraph
//!    has 5 sentences. Leftovers form a final paragraph.
//! 5. Join paragraphs with a blank line. Above 2000 characters, cut at the
//!    last `.` if it sits at position 1500 or later, otherwise cut at 2000 and
//!    append `...`.
//!
//! Lengths and positions count characters, not bytes.

use crate::models::RetrievedDocument;

pub const NO_DOCUMENTS: &str = "No relevant information found in the documents.";
pub const NO_READABLE_CONTENT: &str = "No readable content found in the retrieved documents.";

const MIN_DOC_CHARS: usize = 20;
const MAX_DOCS: usize = 5;
const MIN_SENTENCE_CHARS: usize = 30;
const MAX_SENTENCES: usize = 15;
const MIN_PARAGRAPH: usize = 3;
const MAX_PARAGRAPH: usize = 5;
const FALLBACK_CHARS: usize = 1000;
const MAX_ANSWER_CHARS: usize = 2000;
const MIN_PERIOD_CUT: usize = 1500;

pub fn summarize(docs: &[RetrievedDocument]) -> String {
    if docs.is_empty() {
        return NO_DOCUMENTS.to_string();
    }

    let texts: Vec<&str> = docs
        .iter()
        .map(|d| d.text.trim())
        .filter(|t| t.chars().count() > MIN_DOC_CHARS)
        .collect();

    let Some(first) = texts.first() else {
        return NO_READABLE_CONTENT.to_string();
    };

    let combined = texts
        .iter()
        .take(MAX_DOCS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");

    let valid: Vec<&str> = split_sentences(&combined)
        .into_iter()
        .map(str::trim)
        .filter(|s| s.chars().count() > MIN_SENTENCE_CHARS && ends_sentence(s))
        .collect();

    if valid.is_empty() {
        return first.chars().take(FALLBACK_CHARS).collect();
    }

    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for (i, sentence) in valid.iter().take(MAX_SENTENCES).enumerate() {
        current.push(sentence);
        let is_last = i == valid.len() - 1;
        if current.len() >= MIN_PARAGRAPH && (is_last || current.len() >= MAX_PARAGRAPH) {
            paragraphs.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    cap_length(paragraphs.join("\n\n"))
}

fn ends_sentence(s: &str) -> bool {
    s.ends_with('.') || s.ends_with('!') || s.ends_with('?')
}

/// Split after `.`, `!` or `?` when followed by a whitespace run. The
/// whitespace itself is dropped.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c.is_whitespace() && matches!(prev, Some('.' | '!' | '?')) {
            sentences.push(&text[start..idx]);
            let mut next_start = text.len();
            while let Some(&(j, w)) = chars.peek() {
                if w.is_whitespace() {
                    chars.next();
                } else {
                    next_start = j;
                    break;
                }
            }
            start = next_start;
            prev = None;
            continue;
        }
        prev = Some(c);
    }

    sentences.push(&text[start..]);
    sentences
}

fn cap_length(answer: String) -> String {
    let chars: Vec<char> = answer.chars().collect();
    if chars.len() <= MAX_ANSWER_CHARS {
        return answer;
    }

    let truncated = &chars[..MAX_ANSWER_CHARS];
    match truncated.iter().rposition(|c| *c == '.') {
        Some(last_period) if last_period >= MIN_PERIOD_CUT => {
            truncated[..=last_period].iter().collect()
        }
        _ => {
            let mut cut: String = truncated.iter().collect();
            cut.push_str("...");
            cut
        }
    }
}
