//! Audit log export as JSON or CSV.

use std::fmt;
use std::str::FromStr;

use crate::error::DatabaseError;
use crate::model::{ActionOutcome, AuditEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown export format '{other}' (json or csv)")),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Csv => "csv",
        })
    }
}

const CSV_HEADER: [&str; 13] = [
    "message_id",
    "processed_at",
    "status",
    "account",
    "folder",
    "sender",
    "subject",
    "category",
    "priority",
    "classification_status",
    "actions",
    "error",
    "attempts",
];

/// Render entries in the given format. JSON keeps the full entry; CSV has
/// one row per entry with actions flattened into one cell.
pub fn render(entries: &[AuditEntry], format: ExportFormat) -> Result<String, DatabaseError> {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(entries)
            .map_err(|e| DatabaseError::Serialization(format!("audit export: {e}"))),
        ExportFormat::Csv => Ok(to_csv(entries)),
    }
}

fn to_csv(entries: &[AuditEntry]) -> String {
    let mut out = String::new();
    push_row(&mut out, CSV_HEADER.iter().map(|h| h.to_string()));
    for e in entries {
        let actions = e
            .actions_applied
            .iter()
            .map(|a| {
                let outcome = match &a.outcome {
                    ActionOutcome::Applied => "applied".to_string(),
                    ActionOutcome::Planned => "planned".to_string(),
                    ActionOutcome::Failed { reason } => format!("failed: {reason}"),
                };
                format!("{}: {} ({outcome})", a.rule_id, a.action.describe())
            })
            .collect::<Vec<_>>()
            .join("; ");
        push_row(
            &mut out,
            [
                e.message_id.clone(),
                e.processed_at.to_rfc3339(),
                e.status.as_str().to_string(),
                e.account.clone(),
                e.folder.clone(),
                e.sender.clone(),
                e.subject.clone(),
                e.classification
                    .as_ref()
                    .map(|c| c.category.as_str().to_string())
                    .unwrap_or_default(),
                e.classification
                    .as_ref()
                    .map(|c| c.priority.as_str().to_string())
                    .unwrap_or_default(),
                e.classification_status.as_str().to_string(),
                actions,
                e.error.clone().unwrap_or_default(),
                e.attempts.to_string(),
            ]
            .into_iter(),
        );
    }
    out
}

fn push_row(out: &mut String, fields: impl Iterator<Item = String>) {
    let cells: Vec<String> = fields.map(|f| csv_cell(&f)).collect();
    out.push_str(&cells.join(","));
    out.push_str("\r\n");
}

/// Quote when the cell holds a separator, quote or line break.
fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
