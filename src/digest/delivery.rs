//! Digest sinks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tracing::info;

use super::format::{DigestData, render};
use crate::config::{DeliverySettings, Settings};
use crate::error::DigestError;
use crate::model::{Digest, DigestFormat};

/// A delivery target. Sinks fail independently of each other.
#[async_trait]
pub trait DigestSink: Send + Sync {
    /// Name recorded in the digest's delivery results.
    fn name(&self) -> String;

    /// Deliver one digest; returns where it went.
    async fn deliver(&self, digest: &Digest, data: &DigestData) -> Result<String, DigestError>;
}

/// Writes `digest_<YYYYmmdd_HHMMSS>.<ext>` into a directory.
pub struct FileSink {
    output_dir: PathBuf,
    format: DigestFormat,
}

impl FileSink {
    pub fn new(output_dir: impl Into<PathBuf>, format: DigestFormat) -> Self {
        Self {
            output_dir: output_dir.into(),
            format,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn file_name(&self, digest: &Digest) -> String {
        format!(
            "digest_{}.{}",
            digest
                .created_at
                .with_timezone(&Local)
                .format("%Y%m%d_%H%M%S"),
            self.format.extension()
        )
    }
}

#[async_trait]
impl DigestSink for FileSink {
    fn name(&self) -> String {
        format!("file:{}", self.format.as_str())
    }

    async fn deliver(&self, digest: &Digest, data: &DigestData) -> Result<String, DigestError> {
        let fail = |reason: String| DigestError::Delivery {
            sink: self.name(),
            reason,
        };
        let content = match self.format {
            DigestFormat::Markdown => digest.content.clone(),
            other => render(data, other),
        };
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| fail(format!("create {}: {e}", self.output_dir.display())))?;
        let path = self.output_dir.join(self.file_name(digest));
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| fail(format!("write {}: {e}", path.display())))?;
        info!(digest_id = %digest.id, path = %path.display(), "Digest delivered");
        Ok(path.display().to_string())
    }
}

/// Build the configured sinks; a file sink in `<data_dir>/digests` when
/// none are configured.
pub fn build_sinks(settings: &Settings) -> Vec<Arc<dyn DigestSink>> {
    let delivery = &settings.service.digest.delivery;
    if delivery.is_empty() {
        return vec![Arc::new(FileSink::new(
            settings.digest_dir(),
            DigestFormat::Markdown,
        ))];
    }
    delivery
        .iter()
        .map(|d| match d {
            DeliverySettings::File { format, output_dir } => Arc::new(FileSink::new(
                output_dir.clone().unwrap_or_else(|| settings.digest_dir()),
                *format,
            )) as Arc<dyn DigestSink>,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::model::DigestStatus;

    fn digest() -> Digest {
        Digest {
            id: Uuid::new_v4(),
            period_start: Utc::now(),
            period_end: Utc::now(),
            included_message_ids: BTreeSet::new(),
            summary_text: "summary".into(),
            content: "# Email Digest".into(),
            format: DigestFormat::Markdown,
            delivery_results: vec![],
            status: DigestStatus::Pending,
            created_at: Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 5).unwrap(),
        }
    }

    fn data() -> DigestData {
        DigestData {
            generated_at: Local::now(),
            summary: "summary".into(),
            total: 0,
            sections: vec![],
            action_items: None,
            multi_account: false,
        }
    }

    #[tokio::test]
    async fn file_sink_writes_timestamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("out"), DigestFormat::Markdown);
        let d = digest();
        let location = sink.deliver(&d, &data()).await.unwrap();

        let expected = format!(
            "digest_{}.md",
            d.created_at.with_timezone(&Local).format("%Y%m%d_%H%M%S")
        );
        assert!(location.ends_with(&expected));
        let written = std::fs::read_to_string(&location).unwrap();
        assert_eq!(written, "# Email Digest");
    }

    #[tokio::test]
    async fn html_sink_renders_from_data() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path(), DigestFormat::Html);
        let location = sink.deliver(&digest(), &data()).await.unwrap();
        assert!(location.ends_with(".html"));
        let written = std::fs::read_to_string(&location).unwrap();
        assert!(written.starts_with("<!DOCTYPE html>"));
    }

    #[tokio::test]
    async fn unwritable_directory_is_delivery_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let sink = FileSink::new(blocker.join("sub"), DigestFormat::Text);
        let err = sink.deliver(&digest(), &data()).await.unwrap_err();
        assert!(matches!(err, DigestError::Delivery { .. }));
    }

    #[test]
    fn default_sink_uses_data_dir() {
        let mut settings = Settings::default();
        settings.service.digest.delivery.clear();
        let sinks = build_sinks(&settings);
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name(), "file:markdown");
    }
}
