//! Built-in capability units shipped with the CLI.
//!
//! Each unit is an [`Entrypoint`] registered under a stable id; the matching
//! manifests are written into the module directory on first run and can be
//! edited or deleted like any third-party manifest afterwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metasieve_core::{Entrypoint, FieldMap, UnitContext, UnitError};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// All built-in entrypoints, keyed by manifest id.
pub fn builtin_entrypoints() -> Vec<(&'static str, Arc<dyn Entrypoint>)> {
    vec![
        ("stat", Arc::new(StatUnit) as Arc<dyn Entrypoint>),
        ("mime", Arc::new(MimeUnit)),
        ("digest", Arc::new(DigestUnit)),
        ("summary", Arc::new(SummaryUnit)),
    ]
}

/// Write manifests for the built-in units into `dir`, skipping any that
/// already exist so local edits survive restarts.
pub fn write_default_manifests(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let manifests: [(&str, &str); 4] = [
        ("stat", "entrypoint = \"stat\"\n"),
        ("mime", "entrypoint = \"mime\"\n"),
        ("digest", "entrypoint = \"digest\"\n"),
        (
            "summary",
            "entrypoint = \"summary\"\ndependencies = [\"stat\", \"mime\"]\n",
        ),
    ];
    for (name, body) in manifests {
        let path = dir.join(format!("{name}.toml"));
        if !path.exists() {
            std::fs::write(path, body)?;
        }
    }
    Ok(())
}

/// Filesystem metadata: size, modification time, permissions.
pub struct StatUnit;

#[async_trait]
impl Entrypoint for StatUnit {
    async fn run(&self, ctx: &UnitContext) -> Result<FieldMap, UnitError> {
        let meta = tokio::fs::metadata(&ctx.file.path).await?;

        let mut fields = FieldMap::new();
        fields.insert("size_bytes".to_string(), json!(meta.len()));
        fields.insert("readonly".to_string(), json!(meta.permissions().readonly()));
        if let Ok(modified) = meta.modified() {
            let stamp: DateTime<Utc> = modified.into();
            fields.insert("modified".to_string(), json!(stamp.to_rfc3339()));
        }
        Ok(fields)
    }
}

/// MIME type, preferring what the descriptor already sniffed.
pub struct MimeUnit;

#[async_trait]
impl Entrypoint for MimeUnit {
    async fn run(&self, ctx: &UnitContext) -> Result<FieldMap, UnitError> {
        let (mime_type, source) = match &ctx.file.mime_type {
            Some(mime) => (mime.clone(), "descriptor"),
            None => (
                mime_guess::from_path(&ctx.file.path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
                "extension",
            ),
        };

        let mut fields = FieldMap::new();
        fields.insert("mime_type".to_string(), json!(mime_type));
        fields.insert("mime_source".to_string(), json!(source));
        Ok(fields)
    }
}

/// Content digest computed over the chunked stream, so a file is never
/// resident in full regardless of its size.
pub struct DigestUnit;

#[async_trait]
impl Entrypoint for DigestUnit {
    async fn run(&self, ctx: &UnitContext) -> Result<FieldMap, UnitError> {
        let mut stream = ctx.open_stream().await?;
        let mut hasher = blake3::Hasher::new();
        let mut bytes_hashed = 0u64;
        while let Some(chunk) = stream.next_chunk().await? {
            hasher.update(chunk);
            bytes_hashed += chunk.len() as u64;
        }

        let mut fields = FieldMap::new();
        fields.insert(
            "blake3".to_string(),
            json!(hasher.finalize().to_hex().to_string()),
        );
        fields.insert("bytes_hashed".to_string(), json!(bytes_hashed));
        Ok(fields)
    }
}

/// One-line description combining upstream stat and mime output.
///
/// Degrades rather than fails: a missing or failed upstream shows up as
/// `unknown` in the summary.
pub struct SummaryUnit;

#[async_trait]
impl Entrypoint for SummaryUnit {
    async fn run(&self, ctx: &UnitContext) -> Result<FieldMap, UnitError> {
        let size = ctx
            .upstream
            .fields("stat")
            .and_then(|f| f.get("size_bytes"))
            .and_then(serde_json::Value::as_u64);
        let mime = ctx
            .upstream
            .fields("mime")
            .and_then(|f| f.get("mime_type"))
            .and_then(serde_json::Value::as_str);

        let size_part = size.map_or_else(|| "unknown size".to_string(), format_size);
        let mime_part = mime.unwrap_or("unknown type");

        let mut fields = FieldMap::new();
        fields.insert(
            "summary".to_string(),
            json!(format!("{mime_part}, {size_part}")),
        );
        Ok(fields)
    }
}

fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    match bytes {
        b if b >= GIB => format!("{:.1} GiB", b as f64 / GIB as f64),
        b if b >= MIB => format!("{:.1} MiB", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KiB", b as f64 / KIB as f64),
        b => format!("{b} B"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metasieve_core::{FileDescriptor, Strategy, UpstreamOutcome, UpstreamResults};
    use metasieve_memory::{BufferPool, StreamingLayer};
    use tempfile::TempDir;

    async fn context_for(path: &Path) -> UnitContext {
        UnitContext {
            file: FileDescriptor::from_path(path).await.unwrap(),
            strategy: Strategy::Conservative,
            upstream: UpstreamResults::default(),
            io: Arc::new(StreamingLayer::new(Arc::new(BufferPool::default()))),
        }
    }

    #[tokio::test]
    async fn test_stat_reports_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, b"hello units").unwrap();

        let fields = StatUnit.run(&context_for(&path).await).await.unwrap();
        assert_eq!(fields["size_bytes"], json!(11));
        assert!(fields.contains_key("modified"));
    }

    #[tokio::test]
    async fn test_mime_falls_back_to_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"plain text").unwrap();

        let mut ctx = context_for(&path).await;
        ctx.file.mime_type = None;
        let fields = MimeUnit.run(&ctx).await.unwrap();
        assert_eq!(fields["mime_type"], json!("text/plain"));
        assert_eq!(fields["mime_source"], json!("extension"));
    }

    #[tokio::test]
    async fn test_digest_matches_whole_file_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let fields = DigestUnit.run(&context_for(&path).await).await.unwrap();
        assert_eq!(
            fields["blake3"],
            json!(blake3::hash(&content).to_hex().to_string())
        );
        assert_eq!(fields["bytes_hashed"], json!(content.len() as u64));
    }

    #[tokio::test]
    async fn test_summary_degrades_on_missing_upstream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.dat");
        std::fs::write(&path, b"x").unwrap();

        let mut ctx = context_for(&path).await;
        ctx.upstream
            .insert("stat", UpstreamOutcome::Failed("stat broke".to_string()));
        let fields = SummaryUnit.run(&ctx).await.unwrap();
        assert_eq!(fields["summary"], json!("unknown type, unknown size"));
    }

    #[test]
    fn test_default_manifests_do_not_clobber_edits() {
        let dir = TempDir::new().unwrap();
        write_default_manifests(dir.path()).unwrap();
        std::fs::write(dir.path().join("stat.toml"), "entrypoint = \"mime\"\n").unwrap();
        write_default_manifests(dir.path()).unwrap();
        let text = std::fs::read_to_string(dir.path().join("stat.toml")).unwrap();
        assert_eq!(text, "entrypoint = \"mime\"\n");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
