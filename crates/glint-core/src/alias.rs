//! Human-friendly filename aliases.
//!
//! The content-addressed storage file is never touched. The worker only
//! updates the display name in the database and maintains a readable
//! symlink under a `named/` directory that sits beside the `assets/`
//! storage directory.

use std::path::Path;

use crate::provider::VlmProvider;
use crate::types::{Job, NameMode};

/// Slugify a title into a filesystem-friendly base name: lowercase, each
/// maximal non-alphanumeric run becomes a single dash, trimmed and capped
/// at 64 characters.
pub fn slugify_title(text: &str) -> String {
    let mut out = String::new();
    let mut dash = false;
    for ch in text.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            dash = false;
        } else if !dash {
            out.push('-');
            dash = true;
        }
    }
    let mut slug = out
        .trim_matches('-')
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    slug.truncate(64);
    slug
}

/// Extension (with leading dot) from the storage path, falling back to the
/// original display name.
pub fn pick_extension(job: &Job) -> String {
    extension_of(&job.storage_path)
        .or_else(|| extension_of(&job.original_name))
        .unwrap_or_default()
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
}

/// `<slug>--<sha8><ext>`; the `--<sha8>` disambiguator is omitted only
/// when the asset has no hash. `None` when the title slugifies to nothing.
pub fn pretty_name(title: &str, job: &Job) -> Option<String> {
    let base = slugify_title(title);
    if base.is_empty() {
        return None;
    }
    let ext = pick_extension(job);
    let sha8: String = job.sha256.chars().take(8).collect();
    if sha8.is_empty() {
        Some(format!("{base}{ext}"))
    } else {
        Some(format!("{base}--{sha8}{ext}"))
    }
}

/// Resolve the alias title: a dedicated VLM query when configured, with
/// the caption as the default and the fallback for any query failure.
pub async fn resolve_title(
    provider: &dyn VlmProvider,
    job: &Job,
    caption: &str,
    mode: NameMode,
) -> String {
    if mode == NameMode::Query {
        let prompt = "Give a short descriptive title for this image suitable as a filename. \
                      Respond with ONLY the title words (no punctuation, no quotes), max 6 words.";
        match provider.query(&job.storage_path, prompt).await {
            Ok(title) if !title.trim().is_empty() => return title.trim().to_string(),
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "title query failed, falling back to caption");
            }
        }
    }
    caption.trim().to_string()
}

/// Create or refresh the named symlink for an asset. Filesystem problems
/// are logged and swallowed; they must never fail the enrichment.
pub fn install_alias(storage_path: &str, pretty: &str, sha8: &str, ext: &str) {
    if let Err(err) = try_install_alias(storage_path, pretty, sha8, ext) {
        tracing::debug!(error = %err, "named alias not created");
    }
}

fn try_install_alias(
    storage_path: &str,
    pretty: &str,
    sha8: &str,
    ext: &str,
) -> std::io::Result<()> {
    // storage_path layout: <project_root>/assets/<sha>.<ext>
    let storage = Path::new(storage_path);
    let project_root = storage.parent().and_then(Path::parent).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "storage path has no project root",
        )
    })?;
    let named_dir = project_root.join("named");
    std::fs::create_dir_all(&named_dir)?;
    let link_path = named_dir.join(pretty);

    // Drop stale aliases for this asset (same sha8 + extension, older slug).
    if !sha8.is_empty() && !ext.is_empty() {
        let suffix = format!("--{sha8}{ext}");
        if let Ok(entries) = std::fs::read_dir(&named_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(&suffix) && name != pretty {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }

    // symlink_metadata also sees dangling links, which plain exists() misses.
    if link_path.symlink_metadata().is_ok() {
        let _ = std::fs::remove_file(&link_path);
    }
    make_symlink(storage, &link_path)
}

#[cfg(unix)]
fn make_symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn make_symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}
