//! Token-level text diffing for incremental indexing.
//!
//! Every OCR observation is diffed against the previous snapshot and only the
//! inserted runs are persisted, which bounds index growth and avoids the same
//! on-screen text being indexed once per frame.

/// Classification of one diffed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Insert,
    Delete,
    Equal,
}

/// One contiguous run of the edit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSpan {
    pub kind: EditKind,
    pub text: String,
}

/// DP cost cap; beyond this the middle section is treated as replaced wholesale.
const LCS_CELL_LIMIT: usize = 4_000_000;

/// Computes an edit script between two text snapshots.
///
/// Runs are word granular (whitespace runs are their own tokens) so inserted
/// text keeps its separators: `diff("draft", "draft v2")` yields an insert
/// span of `" v2"`.
pub fn diff(old: &str, new: &str) -> Vec<EditSpan> {
    let old_tokens = tokenize(old);
    let new_tokens = tokenize(new);

    let common_prefix = old_tokens
        .iter()
        .zip(new_tokens.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let common_suffix = old_tokens[common_prefix..]
        .iter()
        .rev()
        .zip(new_tokens[common_prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old_tokens[common_prefix..old_tokens.len() - common_suffix];
    let new_mid = &new_tokens[common_prefix..new_tokens.len() - common_suffix];

    let mut spans = Vec::new();
    if common_prefix > 0 {
        push_span(
            &mut spans,
            EditKind::Equal,
            &old_tokens[..common_prefix].concat(),
        );
    }

    if old_mid.len().saturating_mul(new_mid.len()) > LCS_CELL_LIMIT {
        // Too large for the quadratic table; report a wholesale replacement.
        push_span(&mut spans, EditKind::Delete, &old_mid.concat());
        push_span(&mut spans, EditKind::Insert, &new_mid.concat());
    } else {
        for span in lcs_spans(old_mid, new_mid) {
            push_span(&mut spans, span.kind, &span.text);
        }
    }

    if common_suffix > 0 {
        push_span(
            &mut spans,
            EditKind::Equal,
            &old_tokens[old_tokens.len() - common_suffix..].concat(),
        );
    }
    spans
}

/// The concatenation of all inserted runs, the only part that gets indexed.
pub fn added_text(old: &str, new: &str) -> String {
    diff(old, new)
        .into_iter()
        .filter(|s| s.kind == EditKind::Insert)
        .map(|s| s.text)
        .collect()
}

fn tokenize(s: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_whitespace: Option<bool> = None;
    for (i, ch) in s.char_indices() {
        let ws = ch.is_whitespace();
        match in_whitespace {
            Some(prev) if prev != ws => {
                tokens.push(&s[start..i]);
                start = i;
                in_whitespace = Some(ws);
            }
            Some(_) => {}
            None => in_whitespace = Some(ws),
        }
    }
    if start < s.len() {
        tokens.push(&s[start..]);
    }
    tokens
}

fn push_span(spans: &mut Vec<EditSpan>, kind: EditKind, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(last) = spans.last_mut() {
        if last.kind == kind {
            last.text.push_str(text);
            return;
        }
    }
    spans.push(EditSpan {
        kind,
        text: text.to_string(),
    });
}

/// Standard longest-common-subsequence walk over the unshared middle tokens.
fn lcs_spans(old: &[&str], new: &[&str]) -> Vec<EditSpan> {
    let n = old.len();
    let m = new.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if old[i] == new[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut spans = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            push_span(&mut spans, EditKind::Equal, old[i]);
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            push_span(&mut spans, EditKind::Delete, old[i]);
            i += 1;
        } else {
            push_span(&mut spans, EditKind::Insert, new[j]);
            j += 1;
        }
    }
    while i < n {
        push_span(&mut spans, EditKind::Delete, old[i]);
        i += 1;
    }
    while j < m {
        push_span(&mut spans, EditKind::Insert, new[j]);
        j += 1;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_text_is_the_only_insert() {
        assert_eq!(added_text("draft", "draft v2"), " v2");
    }

    #[test]
    fn identical_snapshots_add_nothing() {
        let spans = diff("same text here", "same text here");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, EditKind::Equal);
        assert_eq!(added_text("same text here", "same text here"), "");
    }

    #[test]
    fn first_observation_is_fully_added() {
        assert_eq!(added_text("", "hello world"), "hello world");
    }

    #[test]
    fn deletions_are_not_re_emitted() {
        // Text scrolling off screen must not show up as new content.
        assert_eq!(added_text("alpha beta gamma", "beta gamma"), "");
    }

    #[test]
    fn interleaved_edits() {
        let spans = diff("the quick fox", "the slow brown fox");
        let added: String = spans
            .iter()
            .filter(|s| s.kind == EditKind::Insert)
            .map(|s| s.text.as_str())
            .collect();
        assert!(added.contains("slow"));
        assert!(added.contains("brown"));
        let deleted: String = spans
            .iter()
            .filter(|s| s.kind == EditKind::Delete)
            .map(|s| s.text.as_str())
            .collect();
        assert!(deleted.contains("quick"));
    }

    #[test]
    fn unchanged_text_never_added_across_growth() {
        // Additive property: feeding growing snapshots re-emits nothing.
        let snapshots = ["a", "a b", "a b c", "a b c d"];
        let mut last = String::new();
        let mut total_added = String::new();
        for snap in snapshots {
            total_added.push_str(&added_text(&last, snap));
            last = snap.to_string();
        }
        assert_eq!(total_added, "a b c d");
    }

    #[test]
    fn whitespace_runs_are_preserved() {
        assert_eq!(added_text("a", "a\n\nb"), "\n\nb");
    }
}
