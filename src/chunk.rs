//! Character-window text splitter.
//!
//! Splits asset text into pieces of at most `chunk_size` characters, with
//! `overlap` characters of the previous piece repeated at the start of the
//! next. Cut points prefer, in order: a paragraph break (`\n\n`), a line
//! break, a sentence end (`. `, `! `, `? `), then any space. Only when a window
//! contains none of these is it cut mid-word.

use crate::models::NewChunk;

/// Split `text` into overlapping windows. Whitespace-only pieces are dropped.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let total = chars.len();
    let byte_at = |i: usize| if i >= total { text.len() } else { chars[i].0 };

    let mut pieces = Vec::new();
    let mut start = 0;

    while start < total {
        let window_end = (start + chunk_size).min(total);
        let end = if window_end == total {
            total
        } else {
            let window = &text[byte_at(start)..byte_at(window_end)];
            match best_cut(window) {
                Some(cut_bytes) => {
                    let cut_chars = window[..cut_bytes].chars().count();
                    // A cut inside the overlap region would stall the window.
                    if cut_chars > overlap {
                        start + cut_chars
                    } else {
                        window_end
                    }
                }
                None => window_end,
            }
        };

        let piece = text[byte_at(start)..byte_at(end)].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }

        if end >= total {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    pieces
}

/// Byte offset just past the preferred boundary in `window`.
fn best_cut(window: &str) -> Option<usize> {
    if let Some(pos) = window.rfind("\n\n") {
        return Some(pos + 2);
    }
    if let Some(pos) = window.rfind('\n') {
        return Some(pos + 1);
    }
    let sentence_end = [". ", "! ", "? "]
        .iter()
        .filter_map(|sep| window.rfind(sep))
        .max();
    if let Some(pos) = sentence_end {
        return Some(pos + 2);
    }
    window.rfind(' ').map(|pos| pos + 1)
}

/// Chunk an asset's text into rows ready for insertion. Orders start at 1.
pub fn chunks_for_asset(
    project_id: i64,
    asset_id: i64,
    source: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<NewChunk> {
    split_text(text, chunk_size, overlap)
        .into_iter()
        .enumerate()
        .map(|(i, piece)| NewChunk {
            chunk_text: piece,
            chunk_metadata: serde_json::json!({ "source": source }),
            chunk_order: i as i64 + 1,
            chunk_project_id: project_id,
            chunk_asset_id: asset_id,
        })
        .collect()
}
