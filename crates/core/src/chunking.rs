use crate::error::ChunkingError;
use crate::models::{Chunk, ChunkingConfig, Document};

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ChunkingError> {
        if self.chunk_size == 0 {
            return Err(ChunkingError::InvalidConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ChunkingError::InvalidConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    pub fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }
}

pub fn split_documents(
    documents: &[Document],
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, ChunkingError> {
    config.validate()?;

    let mut chunks = Vec::new();
    for document in documents {
        for (start_index, content) in split_text(&document.content, config) {
            chunks.push(Chunk {
                content,
                metadata: document.metadata.clone(),
                start_index,
            });
        }
    }

    Ok(chunks)
}

/// Split `text` into overlapping windows of at most `chunk_size` characters.
///
/// Windows are cut from the whitespace-collapsed text (see
/// [`collapse_whitespace`]), so a long blank stretch cannot swallow a whole
/// window. Returns `(char offset in text, trimmed window)` pairs. `config`
/// must be valid.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<(usize, String)> {
    let collapsed = collapse_whitespace(text);
    let chars: Vec<char> = collapsed.iter().map(|&(_, c)| c).collect();
    let len = chars.len();
    let step = config.step();

    let mut windows = Vec::new();
    let mut start = 0;

    while start < len {
        let hard_end = (start + config.chunk_size).min(len);
        let end = if hard_end == len {
            len
        } else {
            let floor = start + (config.chunk_size / 2).max(config.chunk_overlap + 1);
            find_break(&chars, floor, hard_end).unwrap_or(hard_end)
        };

        let content_end = match trimmed_window(&chars, start, end) {
            Some((offset, content)) => {
                let content_end = offset + content.chars().count();
                windows.push((collapsed[offset].0, content));
                content_end
            }
            None => end,
        };

        start = if end == len {
            start + step
        } else {
            next_start(&chars, start, end, content_end, config)
        };
    }

    windows
}

/// Every whitespace run becomes a single space, or `"\n\n"` when the run
/// holds a paragraph break; leading and trailing whitespace is dropped.
/// Each kept character carries its char offset in `text`.
///
/// Text already passed through `normalize` comes back unchanged.
pub fn collapse_whitespace(text: &str) -> Vec<(usize, char)> {
    let mut kept = Vec::new();
    let mut run: Option<(usize, usize)> = None;

    for (offset, c) in text.chars().enumerate() {
        if c.is_whitespace() {
            let (_, newlines) = run.get_or_insert((offset, 0));
            if c == '\n' {
                *newlines += 1;
            }
            continue;
        }

        if let Some((origin, newlines)) = run.take() {
            if !kept.is_empty() {
                if newlines >= 2 {
                    kept.push((origin, '\n'));
                    kept.push((origin + 1, '\n'));
                } else {
                    kept.push((origin, ' '));
                }
            }
        }
        kept.push((offset, c));
    }

    kept
}

/// Latest boundary in `(floor, hard_end]` usable as an exclusive window end.
fn find_break(chars: &[char], floor: usize, hard_end: usize) -> Option<usize> {
    if floor >= hard_end {
        return None;
    }

    let paragraph = (floor..hard_end)
        .rev()
        .find(|&i| chars[i] == '\n' && i > 0 && chars[i - 1] == '\n');
    if let Some(i) = paragraph {
        return Some(i + 1);
    }

    let sentence = (floor..hard_end)
        .rev()
        .find(|&i| i > 0 && chars[i].is_whitespace() && matches!(chars[i - 1], '.' | '!' | '?'));
    if let Some(i) = sentence {
        return Some(i + 1);
    }

    (floor..hard_end)
        .rev()
        .find(|&i| chars[i].is_whitespace())
        .map(|i| i + 1)
}

/// Start of the window following `[start, end)`.
///
/// Backs off `chunk_overlap` characters from `end`, preferring a word start,
/// and never moves further than one step from `start`. The first visible
/// character of the next window must come before `content_end`, the end of
/// the trimmed current window.
fn next_start(
    chars: &[char],
    start: usize,
    end: usize,
    content_end: usize,
    config: ChunkingConfig,
) -> usize {
    let limit = (start + config.step())
        .min(content_end.saturating_sub(1))
        .max(start + 1);
    let nominal = end.saturating_sub(config.chunk_overlap).clamp(start + 1, limit);

    let at_word_start = chars[nominal - 1].is_whitespace().then_some(nominal);
    let word_start = (nominal..limit)
        .find(|&i| chars[i].is_whitespace())
        .map(|i| i + 1);

    [at_word_start, word_start, Some(nominal)]
        .into_iter()
        .flatten()
        .find(|&candidate| skip_whitespace(chars, candidate) < content_end)
        .unwrap_or(nominal)
}

fn skip_whitespace(chars: &[char], from: usize) -> usize {
    from + chars[from..].iter().take_while(|c| c.is_whitespace()).count()
}

fn trimmed_window(chars: &[char], start: usize, end: usize) -> Option<(usize, String)> {
    let leading = chars[start..end]
        .iter()
        .take_while(|c| c.is_whitespace())
        .count();
    let content: String = chars[start + leading..end].iter().collect();
    let content = content.trim_end().to_string();

    if content.is_empty() {
        None
    } else {
        Some((start + leading, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use serde_json::Value;

    fn config() -> ChunkingConfig {
        ChunkingConfig::default()
    }

    fn prose(sentences: usize) -> String {
        (0..sentences)
            .map(|i| {
                let sentence = format!("Sentence number {i} describes a clinical finding in detail.");
                if i % 6 == 5 {
                    format!("{sentence}\n\n")
                } else {
                    format!("{sentence} ")
                }
            })
            .collect::<String>()
            .trim()
            .to_string()
    }

    fn assert_window_invariants(text: &str, config: ChunkingConfig) {
        let len = text.chars().count();
        let windows = split_text(text, config);
        let minimum = len.div_ceil(config.step());

        assert!(
            windows.len() >= minimum,
            "{} chunks for length {len}, expected at least {minimum}",
            windows.len()
        );

        let mut previous_end: Option<usize> = None;
        for (start, content) in &windows {
            let size = content.chars().count();
            assert!(size <= config.chunk_size, "chunk of {size} chars");
            if let Some(end) = previous_end {
                assert!(*start < end, "chunk at {start} does not overlap previous end {end}");
            }
            previous_end = Some(start + size);
        }
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let overlap_too_big = ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 100,
        };
        let zero = ChunkingConfig {
            chunk_size: 0,
            chunk_overlap: 0,
        };
        assert!(overlap_too_big.validate().is_err());
        assert!(zero.validate().is_err());
        assert!(config().validate().is_ok());
        assert!(split_documents(&[], overlap_too_big).is_err());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let windows = split_text("Aspirin is a blood thinner.\n\nIt reduces clot risk.", config());
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].0, 0);
        assert_eq!(windows[0].1, "Aspirin is a blood thinner.\n\nIt reduces clot risk.");
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(split_text("", config()).is_empty());
    }

    #[test]
    fn prose_respects_size_overlap_and_count() {
        for sentences in [1, 15, 16, 17, 40, 120] {
            assert_window_invariants(&prose(sentences), config());
        }
    }

    #[test]
    fn text_without_boundaries_falls_back_to_hard_cuts() {
        let text = "x".repeat(2_500);
        let windows = split_text(&text, config());

        assert_window_invariants(&text, config());
        assert_eq!(windows[0].1.chars().count(), 1_000);
        assert_eq!(windows[1].0, 800);
    }

    #[test]
    fn windows_prefer_paragraph_breaks() {
        let first = "a".repeat(700);
        let second = "b ".repeat(300);
        let text = format!("{first}\n\n{second}");
        let windows = split_text(&text, config());

        assert_eq!(windows[0].1, first);
        assert_window_invariants(&text, config());
    }

    #[test]
    fn multibyte_text_counts_characters() {
        let text = "é".repeat(1_500);
        let windows = split_text(&text, config());

        assert_window_invariants(&text, config());
        assert!(windows.iter().all(|(_, content)| content.chars().count() <= 1_000));
    }

    #[test]
    fn small_config_invariants_hold() {
        let small = ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 10,
        };
        assert_window_invariants(&prose(12), small);
        assert_window_invariants("one two three four five six seven eight nine ten eleven twelve", small);
    }

    fn collapsed(text: &str) -> String {
        collapse_whitespace(text).into_iter().map(|(_, c)| c).collect()
    }

    #[test]
    fn normalized_text_is_not_changed_by_collapsing() {
        let text = prose(20);
        assert_eq!(collapsed(&text), text);
    }

    #[test]
    fn whitespace_runs_collapse_with_original_offsets() {
        let kept = collapse_whitespace("  a \t\tb\n \n\tc \n");
        let text: String = kept.iter().map(|&(_, c)| c).collect();
        let offsets: Vec<usize> = kept.iter().map(|&(offset, _)| offset).collect();

        assert_eq!(text, "a b\n\nc");
        assert_eq!(offsets, vec![2, 3, 6, 7, 8, 11]);
    }

    #[test]
    fn blank_gap_longer_than_a_window_keeps_chunks_overlapping() {
        let gap = "\t".repeat(3_000);
        let text = format!("x{gap}y");
        let windows = split_text(&text, config());
        assert_eq!(windows, vec![(0, "x y".to_string())]);

        let padded = format!("{}{gap}{}", prose(30), prose(30));
        let flat = collapsed(&padded);
        assert_window_invariants(&flat, config());

        let windows = split_text(&padded, config());
        let flat_windows = split_text(&flat, config());
        assert_eq!(windows.len(), flat_windows.len());
        for ((raw_start, raw), (flat_start, flat)) in windows.iter().zip(&flat_windows) {
            assert_eq!(raw, flat);
            assert!(raw_start >= flat_start);
        }
        assert!(windows.last().is_some_and(|(start, _)| *start > 3_000));
    }

    #[test]
    fn metadata_is_copied_onto_every_chunk() -> Result<(), ChunkingError> {
        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), Value::from("data/cardio.pdf"));
        metadata.insert("page".to_string(), Value::from(4));
        let document = Document::new(prose(60), metadata.clone());

        let chunks = split_documents(&[document], config())?;

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.metadata == metadata));
        assert_eq!(chunks[0].start_index, 0);
        assert!(chunks.windows(2).all(|pair| pair[0].start_index < pair[1].start_index));
        Ok(())
    }
}
