//! Archive-file writer for purged messages, grounded in spec §4.7's
//! "Purge" paragraph (timestamp-substituted filename, first-free-name
//! search) and §6's `{meta:{queue, export_dt}, body:[msg_row, ...]}`
//! archive shape. No teacher file covers archival queues directly; written
//! in the teacher's `std::fs` + `serde_json` idiom.

use crate::message::PersistentMessage;
use chrono::Utc;
use nodegrid_shared::{NodegridError, NodegridResult};
use serde::Serialize;

const MAX_FILENAME_ATTEMPTS: u32 = 1000;

#[derive(Serialize)]
struct ArchiveMeta<'a> {
    queue: &'a str,
    export_dt: chrono::DateTime<Utc>,
}

#[derive(Serialize)]
struct ArchiveFile<'a> {
    meta: ArchiveMeta<'a>,
    body: &'a [PersistentMessage],
}

/// Substitute `*` in `pattern` with a timestamp, then probe filenames
/// (appending `-N` before the extension on collision) up to
/// `MAX_FILENAME_ATTEMPTS` times, per spec §4.7.
pub(crate) fn first_free_filename(pattern: &str) -> NodegridResult<std::path::PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
    let base = pattern.replacen('*', &stamp, 1);
    let path = std::path::PathBuf::from(&base);
    if !path.exists() {
        return Ok(path);
    }
    let (stem, ext) = match base.rsplit_once('.') {
        Some((s, e)) => (s.to_string(), format!(".{e}")),
        None => (base.clone(), String::new()),
    };
    for n in 1..=MAX_FILENAME_ATTEMPTS {
        let candidate = std::path::PathBuf::from(format!("{stem}-{n}{ext}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(NodegridError::Other(format!(
        "could not find a free archive filename for pattern {pattern} after {MAX_FILENAME_ATTEMPTS} attempts"
    )))
}

/// Write `messages` as a structured archive file derived from
/// `archive_fname` (a pattern containing one `*` substituted with a
/// timestamp), creating parent directories as needed.
pub async fn write_archive(queue: &str, archive_fname: &str, messages: &[PersistentMessage]) -> NodegridResult<std::path::PathBuf> {
    let path = first_free_filename(archive_fname)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(NodegridError::Io)?;
        }
    }
    let file = ArchiveFile {
        meta: ArchiveMeta {
            queue,
            export_dt: Utc::now(),
        },
        body: messages,
    };
    let json = serde_json::to_vec_pretty(&file).map_err(NodegridError::Serde)?;
    tokio::fs::write(&path, json).await.map_err(NodegridError::Io)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PersistentMessage;
    use nodegrid_shared::Value;

    #[tokio::test]
    async fn writes_archive_with_queue_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/arc/q_*.json", dir.path().display());
        let messages = vec![PersistentMessage::new(1, "x", Value::Null, None, None)];

        let first = write_archive("q", &pattern, &messages).await.unwrap();
        assert!(first.exists());

        let contents = tokio::fs::read_to_string(&first).await.unwrap();
        assert!(contents.contains("\"queue\": \"q\""));
        assert!(contents.contains("\"body\""));
    }

    #[test]
    fn first_free_filename_suffixes_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let fixed = dir.path().join("q_fixed.json");
        std::fs::write(&fixed, b"{}").unwrap();

        // No `*` to substitute: the pattern resolves straight to the
        // already-occupied path, so the search must fall back to `-1`.
        let pattern = fixed.to_string_lossy().to_string();
        let resolved = first_free_filename(&pattern).unwrap();
        assert_eq!(resolved, dir.path().join("q_fixed-1.json"));
    }
}
