//! Body preparation for LLM tasks.
//!
//! Each task gets a differently cleaned and truncated view of the body so
//! the context budget is spent where it matters: triage needs a short
//! preview, action-item extraction needs most of the latest message.

use std::sync::LazyLock;

use regex::Regex;

/// The LLM task a body is being prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Classify,
    Priority,
    Analyze,
    Summarize,
    ExtractActions,
    DraftReply,
}

impl Task {
    /// Character budget for the body.
    pub fn max_chars(&self) -> usize {
        match self {
            Self::Classify => 500,
            Self::Priority => 800,
            Self::Analyze | Self::Summarize => 4000,
            Self::ExtractActions | Self::DraftReply => 3500,
        }
    }

    /// Replies need the quoted thread for context; everything else reads
    /// only the newest message.
    fn keeps_quotes(&self) -> bool {
        matches!(self, Self::DraftReply)
    }
}

/// Clean and truncate `text` for `task`.
pub fn prepare_body(text: &str, task: Task) -> String {
    let text = strip_mobile_footers(text);
    let mut text = collapse_whitespace(&text);
    if !task.keeps_quotes() {
        text = strip_quoted_replies(&text);
    }
    smart_truncate(&text, task.max_chars())
}

static MOBILE_FOOTERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^Sent from my (iPhone|iPad|Galaxy|Samsung|Android)$",
        r"(?i)^(Get|Sent from) Outlook for (iOS|Android)$",
        r"(?i)^Sent from Mail for Windows$",
        r"(?i)^Sent from Yahoo Mail$",
        r"(?i)^Sent from AOL Mobile Mail$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static QUOTE_HEADERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^On .+wrote:$",
        r"(?i)^-+\s*Original Message\s*-+$",
        r"^_{5,}$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Drop "Sent from my iPhone" style footer lines.
pub fn strip_mobile_footers(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim();
            !MOBILE_FOOTERS.iter().any(|re| re.is_match(trimmed))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove quoted reply content.
///
/// `>` lines are dropped individually. A reply header ("On ... wrote:",
/// "Original Message", an underscore separator) drops everything after it.
pub fn strip_quoted_replies(text: &str) -> String {
    let mut kept = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if QUOTE_HEADERS.iter().any(|re| re.is_match(trimmed)) {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n")
}

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("static regex"));
static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("static regex"));

/// Collapse runs of spaces, trim lines, keep at most one blank line.
pub fn collapse_whitespace(text: &str) -> String {
    let text = HORIZONTAL_WS.replace_all(text, " ");
    let text = text.lines().map(str::trim).collect::<Vec<_>>().join("\n");
    BLANK_RUNS.replace_all(&text, "\n\n").trim().to_string()
}

/// Byte offset of the `n`th char, or the string length.
fn char_offset(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map_or(text.len(), |(i, _)| i)
}

/// Truncate to `max_chars` characters, preferring a sentence end.
///
/// - A sentence end (`.`, `!`, `?` followed by whitespace or the cut) is used
///   if it keeps at least half the budget; no ellipsis is added.
/// - Otherwise the last space past the halfway mark, plus `...`.
/// - Otherwise a hard cut plus `...`.
pub fn smart_truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let window = &text[..char_offset(text, max_chars)];

    let mut last_sentence_end = None;
    let mut chars = window.char_indices().peekable();
    let mut char_pos = 0;
    while let Some((_, c)) = chars.next() {
        char_pos += 1;
        if matches!(c, '.' | '!' | '?') {
            let boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
            if boundary {
                last_sentence_end = Some(char_pos);
            }
        }
    }
    if let Some(end) = last_sentence_end
        && end >= half
    {
        return text[..char_offset(text, end)].trim_end().to_string();
    }

    if let Some(space) = window.rfind(' ') {
        let space_chars = window[..space].chars().count();
        if space_chars > half {
            return format!("{}...", window[..space].trim_end());
        }
    }

    let hard = &text[..char_offset(text, max_chars.saturating_sub(3))];
    format!("{}...", hard.trim_end())
}

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("static regex")
});
static COMMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
static BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("static regex"));
static BLOCK_ENDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</(p|div|tr|li|h[1-6])>").expect("static regex")
});
static CELL_ENDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</td>").expect("static regex"));
static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static ENTITIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").expect("static regex")
});
static CRUFT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s|_\-=]+$").expect("static regex"));

/// Convert an HTML body to compact plain text.
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, "");
    let text = COMMENTS.replace_all(&text, "");
    let text = BREAKS.replace_all(&text, "\n");
    let text = BLOCK_ENDS.replace_all(&text, "\n");
    let text = CELL_ENDS.replace_all(&text, " | ");
    let text = TAGS.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = HORIZONTAL_WS.replace_all(&text, " ");

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !CRUFT_LINE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    ENTITIES
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let decoded = if let Some(num) = name.strip_prefix("#x").or(name.strip_prefix("#X")) {
                u32::from_str_radix(num, 16).ok().and_then(char::from_u32)
            } else if let Some(num) = name.strip_prefix('#') {
                num.parse().ok().and_then(char::from_u32)
            } else {
                match name {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    "ndash" => Some('–'),
                    "mdash" => Some('—'),
                    "hellip" => Some('…'),
                    "copy" => Some('©'),
                    _ => None,
                }
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Truncate at a char boundary, appending an ellipsis when cut.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut = char_offset(s, max_chars.saturating_sub(3));
    format!("{}...", &s[..cut])
}
