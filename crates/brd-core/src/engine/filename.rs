//! Destination filename resolution
//!
//! Picks the name a download is saved under (explicit override, then
//! `Content-Disposition`, then a generated fallback), strips path-traversal
//! characters, and probes the destination directory for collisions.

use crate::error::EngineError;
use brd_types::{FileSnapshot, TaskOptions, FALLBACK_EXTENSION, TEMP_SUFFIX};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::debug;

/// Where one attempt writes, and under which name it is finalized.
///
/// Owned by the engine for the duration of one attempt.
#[derive(Debug, Default)]
pub struct FileDescriptor {
    pub filename: String,
    pub extension: String,
    pub base_name: String,
    pub filepath: PathBuf,
    pub temp_filepath: PathBuf,
    /// Size from Content-Length (0 when absent)
    pub size: u64,
    pub handle: Option<File>,
}

impl FileDescriptor {
    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            filename: self.filename.clone(),
            extension: self.extension.clone(),
            base_name: self.base_name.clone(),
            filepath: self.filepath.clone(),
            temp_filepath: self.temp_filepath.clone(),
            size: self.size,
        }
    }
}

/// Remove quotes, path separators and control characters. Returns an empty
/// string for names that would address the directory itself.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '"' | '/' | '\\') && !c.is_control())
        .collect();
    let cleaned = cleaned.trim();

    if cleaned == "." || cleaned == ".." {
        return String::new();
    }
    cleaned.to_string()
}

/// Extract the filename from a `Content-Disposition` header value.
///
/// Handles both:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename*=UTF-8''example%20file.pdf` (preferred when present)
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in split_parameters(header) {
        let Some((key, value)) = param.trim().split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("filename*") {
            // charset'language'percent-encoded
            let encoded = value.trim().rsplit('\'').next().unwrap_or_default();
            extended = urlencoding::decode(encoded).ok().map(|s| s.into_owned());
        } else if key.eq_ignore_ascii_case("filename") {
            plain = Some(unquote(value));
        }
    }

    extended
        .or(plain)
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.is_empty())
}

/// Split header parameters on `;`. Separators inside quoted strings belong
/// to the value.
fn split_parameters(header: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (idx, c) in header.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(&header[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    params.push(&header[start..]);
    params
}

/// Decode an RFC 6266 quoted-string (`"a\"b"` -> `a"b`). Unquoted tokens are
/// returned trimmed.
fn unquote(value: &str) -> String {
    let value = value.trim();
    let Some(body) = value.strip_prefix('"') else {
        return value.to_string();
    };

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '"' => break,
            c => out.push(c),
        }
    }
    out
}

/// Name used when neither an override nor the response supplies one
pub fn fallback_filename(uid: &str) -> String {
    format!("_{}.{}", sanitize_filename(uid), FALLBACK_EXTENSION)
}

/// Split `name` into `(base, extension)`. Leading-dot names have no extension.
pub fn split_extension(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => {
            (name[..idx].to_string(), name[idx + 1..].to_string())
        }
        _ => (name.to_string(), String::new()),
    }
}

fn numbered_name(base: &str, extension: &str, n: u32) -> String {
    if extension.is_empty() {
        format!("{}_{}", base, n)
    } else {
        format!("{}_{}.{}", base, n, extension)
    }
}

pub fn temp_name(filename: &str) -> String {
    format!("{}{}", filename, TEMP_SUFFIX)
}

async fn is_taken(dir: &Path, name: &str) -> Result<bool, EngineError> {
    for candidate in [dir.join(name), dir.join(temp_name(name))] {
        let exists = tokio::fs::try_exists(&candidate)
            .await
            .map_err(|e| EngineError::fs(&candidate, e))?;
        if exists {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Resolve a collision-free name in `dir`.
///
/// With `clone_files` disabled an existing file is targeted as-is and will be
/// overwritten on finalize. Otherwise `{base}_{n}.{ext}` is probed for
/// `n = 2..=max_suffix`.
pub async fn resolve_collision(
    dir: &Path,
    filename: &str,
    clone_files: bool,
    max_suffix: u32,
) -> Result<String, EngineError> {
    if !clone_files || !is_taken(dir, filename).await? {
        return Ok(filename.to_string());
    }

    let (base, extension) = split_extension(filename);
    for n in 2..=max_suffix {
        let candidate = numbered_name(&base, &extension, n);
        if !is_taken(dir, &candidate).await? {
            debug!("Resolved filename collision: {} -> {}", filename, candidate);
            return Ok(candidate);
        }
    }

    Err(EngineError::NameExhausted {
        filename: filename.to_string(),
        limit: max_suffix,
    })
}

/// Build the file descriptor for a response. The write handle is not opened here.
pub async fn resolve_descriptor(
    options: &TaskOptions,
    content_disposition: Option<&str>,
    content_length: Option<u64>,
) -> Result<FileDescriptor, EngineError> {
    let requested = options
        .filename
        .as_deref()
        .map(sanitize_filename)
        .filter(|name| !name.is_empty())
        .or_else(|| content_disposition.and_then(filename_from_content_disposition))
        .unwrap_or_else(|| fallback_filename(&options.uid));

    let filename = resolve_collision(
        &options.destination,
        &requested,
        options.clone_files,
        options.max_clone_suffix,
    )
    .await?;
    let (base_name, extension) = split_extension(&filename);

    Ok(FileDescriptor {
        filepath: options.destination.join(&filename),
        temp_filepath: options.destination.join(temp_name(&filename)),
        filename,
        extension,
        base_name,
        size: content_length.unwrap_or(0),
        handle: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_disposition_quoted() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="report.pdf""#).as_deref(),
            Some("report.pdf")
        );
    }

    #[test]
    fn test_content_disposition_strips_traversal() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="../../etc/passwd""#)
                .as_deref(),
            Some("....etcpasswd")
        );
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="..\\..\\x.bin""#).as_deref(),
            Some("....x.bin")
        );
        assert_eq!(filename_from_content_disposition("attachment; filename=\"..\""), None);
    }

    #[test]
    fn test_content_disposition_prefers_extended() {
        let header = r#"attachment; filename="fallback.txt"; filename*=UTF-8''na%C3%AFve%20file.txt"#;
        assert_eq!(
            filename_from_content_disposition(header).as_deref(),
            Some("naïve file.txt")
        );
    }

    #[test]
    fn test_content_disposition_quoted_separators() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="a;b.txt""#).as_deref(),
            Some("a;b.txt")
        );
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="say \"hi\"; now.txt"; size=3"#)
                .as_deref(),
            Some("say hi; now.txt")
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename=plain.bin; size=3").as_deref(),
            Some("plain.bin")
        );
    }

    #[test]
    fn test_content_disposition_without_filename() {
        assert_eq!(filename_from_content_disposition("inline"), None);
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("a.tar.gz"), ("a.tar".into(), "gz".into()));
        assert_eq!(split_extension("README"), ("README".into(), String::new()));
        assert_eq!(split_extension(".bashrc"), (".bashrc".into(), String::new()));
        assert_eq!(split_extension("trailing."), ("trailing.".into(), String::new()));
    }

    #[test]
    fn test_fallback_uses_uid() {
        assert_eq!(fallback_filename("abc-123"), "_abc-123.brd");
    }

    #[tokio::test]
    async fn test_collision_sequence_is_increasing_and_unused() {
        let dir = TempDir::new().unwrap();
        let mut seen = Vec::new();

        for _ in 0..5 {
            let name = resolve_collision(dir.path(), "photo.jpg", true, 100)
                .await
                .unwrap();
            assert!(!dir.path().join(&name).exists());
            std::fs::write(dir.path().join(&name), b"x").unwrap();
            seen.push(name);
        }

        assert_eq!(
            seen,
            vec!["photo.jpg", "photo_2.jpg", "photo_3.jpg", "photo_4.jpg", "photo_5.jpg"]
        );
    }

    #[tokio::test]
    async fn test_collision_counts_in_flight_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data.bin.download"), b"partial").unwrap();

        let name = resolve_collision(dir.path(), "data.bin", true, 10).await.unwrap();
        assert_eq!(name, "data_2.bin");
    }

    #[tokio::test]
    async fn test_collision_disabled_targets_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("same.txt"), b"old").unwrap();

        let name = resolve_collision(dir.path(), "same.txt", false, 10).await.unwrap();
        assert_eq!(name, "same.txt");
    }

    #[tokio::test]
    async fn test_collision_cap_is_enforced() {
        let dir = TempDir::new().unwrap();
        for name in ["f", "f_2", "f_3"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let err = resolve_collision(dir.path(), "f", true, 3).await.unwrap_err();
        assert!(matches!(err, EngineError::NameExhausted { limit: 3, .. }));
    }

    #[tokio::test]
    async fn test_resolve_descriptor_precedence() {
        let dir = TempDir::new().unwrap();
        let mut options = TaskOptions::new("http://example.com/x", dir.path());
        options.uid = "task-1".to_string();

        let from_header = resolve_descriptor(&options, Some("attachment; filename=a.zip"), Some(10))
            .await
            .unwrap();
        assert_eq!(from_header.filename, "a.zip");
        assert_eq!(from_header.base_name, "a");
        assert_eq!(from_header.extension, "zip");
        assert_eq!(from_header.size, 10);
        assert_eq!(from_header.temp_filepath, dir.path().join("a.zip.download"));

        let fallback = resolve_descriptor(&options, None, None).await.unwrap();
        assert_eq!(fallback.filename, "_task-1.brd");
        assert_eq!(fallback.size, 0);

        options.filename = Some("chosen/name.txt".to_string());
        let explicit = resolve_descriptor(&options, Some("attachment; filename=a.zip"), None)
            .await
            .unwrap();
        assert_eq!(explicit.filename, "chosenname.txt");
    }
}
