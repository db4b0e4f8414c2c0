use warden_core::FilePatch;

const SYSTEM_PROMPT: &str = "\
You are Warden, an expert code reviewer. You receive the unified diff of a \
pull request and write a single review comment for its author.

Rules:
- Focus on bugs, security vulnerabilities, logic errors, race conditions and resource leaks
- Reference files and lines from the diff when pointing at a problem
- Do not speculate about code you cannot see
- Do not comment on style or naming unless it hides a bug
- If the diff was truncated, review only what you were given and say so
- If you find nothing significant, reply with a short approval

Write GitHub-flavored Markdown. Do not wrap the whole answer in a code block.";

const OUTPUT_MARKER: &str = "\n\n_[review truncated]_";

/// Build the system prompt for the review model.
///
/// # Examples
///
/// ```
/// use warden_review::prompt::build_system_prompt;
///
/// assert!(build_system_prompt().contains("Warden"));
/// ```
pub fn build_system_prompt() -> String {
    SYSTEM_PROMPT.to_string()
}

/// Build the user prompt containing the (already truncated) diff.
///
/// # Examples
///
/// ```
/// use warden_review::prompt::build_review_prompt;
///
/// let prompt = build_review_prompt("+new line");
/// assert!(prompt.contains("```diff\n+new line"));
/// ```
pub fn build_review_prompt(diff: &str) -> String {
    format!("Review the following pull request changes:\n\n```diff\n{diff}\n```\n")
}

/// Diff text after applying the input budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledDiff {
    pub text: String,
    /// Files that were dropped entirely, in order.
    pub omitted: Vec<String>,
    /// File whose patch was cut at a line boundary, if any.
    pub cut: Option<String>,
}

impl AssembledDiff {
    pub fn is_truncated(&self) -> bool {
        !self.omitted.is_empty() || self.cut.is_some()
    }
}

/// Concatenate `files` into diff text bounded by `max_chars`.
///
/// Files are kept whole and in order while the text before them is shorter
/// than the budget. The first file that cannot be kept ends the diff: it and
/// every later file are dropped. Only a leading file that alone exceeds the
/// budget is cut, at the last newline that fits, and only if at least one
/// patch line survives. Truncation is announced by a trailing marker line.
///
/// # Examples
///
/// ```
/// use warden_core::FilePatch;
/// use warden_review::prompt::assemble_diff;
///
/// let files = vec![
///     FilePatch::new("a.rs", "+a"),
///     FilePatch::new("b.rs", "+b"),
/// ];
/// let diff = assemble_diff(&files, 25);
/// assert!(diff.text.contains("+a"));
/// assert_eq!(diff.omitted, vec!["b.rs".to_string()]);
/// ```
pub fn assemble_diff(files: &[FilePatch], max_chars: usize) -> AssembledDiff {
    let mut text = String::new();
    let mut omitted = Vec::new();
    let mut cut = None;

    for (index, file) in files.iter().enumerate() {
        let rendered = render_file(file);
        let fits = text.len() < max_chars && rendered.len() <= max_chars;
        if fits {
            text.push_str(&rendered);
            continue;
        }

        let mut dropped_from = index;
        if text.is_empty() {
            if let Some(kept) = cut_at_line(&rendered, header_len(file), max_chars) {
                text.push_str(kept);
                cut = Some(file.filename.clone());
                dropped_from = index + 1;
            }
        }
        omitted.extend(files[dropped_from..].iter().map(|f| f.filename.clone()));
        break;
    }

    if cut.is_some() || !omitted.is_empty() {
        text.push_str(&truncation_marker(cut.as_deref(), &omitted));
    }

    AssembledDiff { text, omitted, cut }
}

/// Longest prefix of `rendered` within `max_chars` that ends at a newline and
/// keeps at least one line past the `header` bytes.
fn cut_at_line(rendered: &str, header: usize, max_chars: usize) -> Option<&str> {
    let prefix = &rendered[..floor_char_boundary(rendered, max_chars)];
    match prefix.rfind('\n') {
        Some(end) if end >= header => Some(&prefix[..=end]),
        _ => None,
    }
}

fn header_len(file: &FilePatch) -> usize {
    2 * file.filename.len() + "--- a/\n+++ b/\n".len()
}

fn render_file(file: &FilePatch) -> String {
    format!(
        "--- a/{name}\n+++ b/{name}\n{patch}\n",
        name = file.filename,
        patch = file.patch.trim_end_matches('\n')
    )
}

fn truncation_marker(cut: Option<&str>, omitted: &[String]) -> String {
    let mut parts = Vec::new();
    if let Some(name) = cut {
        parts.push(format!("{name} cut at a line boundary"));
    }
    if !omitted.is_empty() {
        parts.push(format!(
            "{} file(s) omitted: {}",
            omitted.len(),
            omitted.join(", ")
        ));
    }
    format!("[diff truncated: {}]\n", parts.join("; "))
}

/// Strip a code fence wrapping the whole review, which some models add.
pub fn strip_code_fences(review: &str) -> &str {
    let trimmed = review.trim();
    if let Some(inner) = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    {
        // Drop the info string (e.g. "markdown") on the opening fence line.
        return match inner.split_once('\n') {
            Some((_, body)) => body.trim(),
            None => inner.trim(),
        };
    }
    trimmed
}

/// Bound `review` to `max_chars`, cutting at the last line that fits and
/// appending a marker.
///
/// # Examples
///
/// ```
/// use warden_review::prompt::bound_output;
///
/// let long = "first line\nsecond line\nthird line";
/// let bounded = bound_output(long, 40);
/// assert!(bounded.len() <= 40);
/// assert!(bounded.starts_with("first line"));
/// ```
pub fn bound_output(review: &str, max_chars: usize) -> String {
    if review.len() <= max_chars {
        return review.to_string();
    }
    if max_chars <= OUTPUT_MARKER.len() {
        return review[..floor_char_boundary(review, max_chars)].to_string();
    }

    let room = max_chars - OUTPUT_MARKER.len();
    let prefix = &review[..floor_char_boundary(review, room)];
    let kept = match prefix.rfind('\n') {
        Some(end) if end > 0 => &prefix[..end],
        _ => prefix,
    };
    format!("{}{OUTPUT_MARKER}", kept.trim_end())
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut end = index;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}
