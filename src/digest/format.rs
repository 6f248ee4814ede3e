//! Digest formatters. Each is a pure function of `DigestData`.

use std::fmt::Write as _;

use chrono::{DateTime, Local};

use crate::model::{ActionItem, Category, DigestFormat, Priority};
use crate::pipeline::text::truncate;

const SUBJECT_MAX_CHARS: usize = 60;

/// Display sections, in render order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    Personal,
    WorkClients,
    WorkAdmin,
    Other,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Personal,
        Section::WorkClients,
        Section::WorkAdmin,
        Section::Other,
    ];

    pub fn for_category(category: Category) -> Self {
        match category {
            Category::Personal => Self::Personal,
            Category::WorkClients => Self::WorkClients,
            Category::WorkAdmin => Self::WorkAdmin,
            Category::Newsletter | Category::Promotional | Category::Spam | Category::Other => {
                Self::Other
            }
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Personal => "Personal",
            Self::WorkClients => "Work (Clients)",
            Self::WorkAdmin => "Work (Admin)",
            Self::Other => "Other",
        }
    }
}

/// One message line in a section.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestLine {
    pub message_id: String,
    pub account: String,
    pub subject: String,
    pub sender: String,
    pub priority: Priority,
}

/// Messages of one account inside a section.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountGroup {
    pub account: String,
    pub lines: Vec<DigestLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigestSection {
    pub section: Section,
    pub groups: Vec<AccountGroup>,
}

impl DigestSection {
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.lines.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a formatter needs. Empty sections are omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestData {
    pub generated_at: DateTime<Local>,
    pub summary: String,
    pub total: usize,
    pub sections: Vec<DigestSection>,
    /// `None` when action items are disabled.
    pub action_items: Option<Vec<ActionItem>>,
    /// More than one account contributed; groups get sub-headings.
    pub multi_account: bool,
}

pub fn render(data: &DigestData, format: DigestFormat) -> String {
    match format {
        DigestFormat::Markdown => render_markdown(data),
        DigestFormat::Html => render_html(data),
        DigestFormat::Text => render_text(data),
    }
}

fn subject_of(line: &DigestLine) -> String {
    if line.subject.trim().is_empty() {
        "(no subject)".into()
    } else {
        truncate(&line.subject, SUBJECT_MAX_CHARS)
    }
}

fn sender_of(line: &DigestLine) -> &str {
    if line.sender.is_empty() { "(unknown)" } else { &line.sender }
}

fn marker(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent => "🔴",
        Priority::High => "🟡",
        Priority::Normal | Priority::Low => "",
    }
}

fn due_suffix(item: &ActionItem) -> String {
    item.due_hint
        .as_deref()
        .map(|d| format!(" (due: {d})"))
        .unwrap_or_default()
}

fn footer_text(data: &DigestData) -> String {
    format!(
        "Generated by inbox-pilot at {}",
        data.generated_at.format("%Y-%m-%dT%H:%M:%S")
    )
}

pub fn render_markdown(data: &DigestData) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Email Digest - {}\n",
        data.generated_at.format("%Y-%m-%d %H:%M")
    );
    let _ = writeln!(out, "## Summary\n\n{}\n", data.summary);
    let _ = writeln!(out, "**Total Emails:** {}\n", data.total);

    for section in &data.sections {
        let _ = writeln!(out, "## {} ({})\n", section.section.title(), section.len());
        for group in &section.groups {
            if data.multi_account {
                let _ = writeln!(out, "### {}\n", group.account);
            }
            for line in &group.lines {
                let m = marker(line.priority);
                let m = if m.is_empty() { String::new() } else { format!("{m} ") };
                let _ = writeln!(out, "- {m}**{}**", subject_of(line));
                let _ = writeln!(out, "  From: {}", sender_of(line));
            }
            out.push('\n');
        }
    }

    if let Some(items) = data.action_items.as_ref().filter(|i| !i.is_empty()) {
        out.push_str("## Action Items\n\n");
        for item in items {
            let _ = writeln!(
                out,
                "- {} **{}**{}",
                marker(item.priority),
                item.title,
                due_suffix(item)
            );
            if !item.description.is_empty() {
                let _ = writeln!(out, "  {}", item.description);
            }
        }
        out.push('\n');
    }

    let _ = write!(out, "---\n*{}*", footer_text(data));
    out
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const HTML_STYLE: &str = "body { font-family: -apple-system, 'Segoe UI', Roboto, Arial, sans-serif; \
max-width: 800px; margin: 2em auto; padding: 0 1em; line-height: 1.6; color: #333; }\n\
h1, h2, h3 { color: #2c3e50; }\n\
h1 { border-bottom: 2px solid #3498db; padding-bottom: 0.3em; }\n\
h2 { border-bottom: 1px solid #bdc3c7; padding-bottom: 0.2em; }\n\
li { margin: 0.5em 0; }\n\
.from { color: #666; font-size: 0.9em; }\n\
hr { border: none; border-top: 1px solid #bdc3c7; margin: 2em 0; }";

pub fn render_html(data: &DigestData) -> String {
    let title = format!("Email Digest - {}", data.generated_at.format("%Y-%m-%d %H:%M"));
    let mut body = String::new();
    let _ = writeln!(body, "<h1>{}</h1>", escape(&title));
    let _ = writeln!(body, "<h2>Summary</h2>\n<p>{}</p>", escape(&data.summary));
    let _ = writeln!(body, "<p><strong>Total Emails:</strong> {}</p>", data.total);

    for section in &data.sections {
        let _ = writeln!(
            body,
            "<h2>{} ({})</h2>",
            escape(section.section.title()),
            section.len()
        );
        for group in &section.groups {
            if data.multi_account {
                let _ = writeln!(body, "<h3>{}</h3>", escape(&group.account));
            }
            body.push_str("<ul>\n");
            for line in &group.lines {
                let m = marker(line.priority);
                let m = if m.is_empty() { String::new() } else { format!("{m} ") };
                let _ = writeln!(
                    body,
                    "<li>{m}<strong>{}</strong><br><span class=\"from\">From: {}</span></li>",
                    escape(&subject_of(line)),
                    escape(sender_of(line))
                );
            }
            body.push_str("</ul>\n");
        }
    }

    if let Some(items) = data.action_items.as_ref().filter(|i| !i.is_empty()) {
        body.push_str("<h2>Action Items</h2>\n<ul>\n");
        for item in items {
            let _ = write!(
                body,
                "<li>{} <strong>{}</strong>{}",
                marker(item.priority),
                escape(&item.title),
                escape(&due_suffix(item))
            );
            if !item.description.is_empty() {
                let _ = write!(body, "<br>{}", escape(&item.description));
            }
            body.push_str("</li>\n");
        }
        body.push_str("</ul>\n");
    }

    let _ = write!(body, "<hr>\n<p><em>{}</em></p>", escape(&footer_text(data)));

    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
         <title>{}</title>\n<style>\n{HTML_STYLE}\n</style>\n</head>\n<body>\n{body}\n</body>\n</html>\n",
        escape(&title)
    )
}

pub fn render_text(data: &DigestData) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Email Digest - {}\n",
        data.generated_at.format("%Y-%m-%d %H:%M")
    );
    let _ = writeln!(out, "Summary\n\n{}\n", data.summary);
    let _ = writeln!(out, "Total Emails: {}\n", data.total);

    for section in &data.sections {
        let _ = writeln!(out, "{} ({})\n", section.section.title(), section.len());
        for group in &section.groups {
            if data.multi_account {
                let _ = writeln!(out, "  [{}]", group.account);
            }
            for line in &group.lines {
                let m = marker(line.priority);
                let m = if m.is_empty() { String::new() } else { format!("{m} ") };
                let _ = writeln!(out, "• {m}{}", subject_of(line));
                let _ = writeln!(out, "  From: {}", sender_of(line));
            }
            out.push('\n');
        }
    }

    if let Some(items) = data.action_items.as_ref().filter(|i| !i.is_empty()) {
        out.push_str("Action Items\n\n");
        for item in items {
            let m = marker(item.priority);
            let m = if m.is_empty() { String::new() } else { format!("{m} ") };
            let _ = writeln!(out, "• {m}{}{}", item.title, due_suffix(item));
            if !item.description.is_empty() {
                let _ = writeln!(out, "  {}", item.description);
            }
        }
        out.push('\n');
    }

    let _ = write!(out, "{}\n{}", "-".repeat(40), footer_text(data));
    out
}
