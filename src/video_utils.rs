use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use walkdir::WalkDir;

/// Longest allowed sanitized title before the timestamp suffix.
const MAX_TITLE_LEN: usize = 200;

/// Strips path-unsafe characters and caps the length.
pub fn sanitize_title(title: &str) -> String {
    title
        .trim()
        .chars()
        .map(|c| match c {
            '/' | ':' | '\\' | '\0' => '.',
            other => other,
        })
        .take(MAX_TITLE_LEN)
        .collect()
}

/// Full on-disk title: sanitized window title plus a second-granular start
/// time so reopened contexts never collide.
pub fn episode_title(raw_title: &str, fallback: &str, start: DateTime<Utc>) -> String {
    let mut title = sanitize_title(raw_title);
    if title.is_empty() {
        title = sanitize_title(fallback);
    }
    format!("{} {}", title, start.format("%Y-%m-%d %H.%M.%S"))
}

/// Deterministic asset path: `<data_dir>/YYYY/MM/DD/<title>.mp4`.
pub fn episode_video_path(data_dir: &Path, start: DateTime<Utc>, title: &str) -> PathBuf {
    data_dir
        .join(start.format("%Y").to_string())
        .join(start.format("%m").to_string())
        .join(start.format("%d").to_string())
        .join(format!("{}.mp4", title))
}

/// Enumerates files under `root` whose modification time falls inside the
/// window, newest first. Hidden files and directories are skipped. Used by
/// the optional file-change tracking after long episodes; it is a coarse,
/// enumeration-based scan, so callers gate it behind a config flag.
pub fn recent_files(
    root: &Path,
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
) -> Vec<(PathBuf, DateTime<Utc>)> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        !e.file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
    });
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let Ok(since_epoch) = modified.duration_since(std::time::UNIX_EPOCH) else {
            continue;
        };
        let Some(modified) = Utc
            .timestamp_opt(since_epoch.as_secs() as i64, since_epoch.subsec_nanos())
            .single()
        else {
            continue;
        };
        if modified >= earliest && modified <= latest {
            found.push((entry.into_path(), modified));
        }
    }
    found.sort_by(|a, b| b.1.cmp(&a.1));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_title("a/b:c"), "a.b.c");
        assert_eq!(sanitize_title("  padded  "), "padded");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_title(&long).len(), 200);
    }

    #[test]
    fn title_falls_back_when_window_title_blank() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 5).unwrap();
        let t = episode_title("   ", "com.example.editor", start);
        assert!(t.starts_with("com.example.editor "));
        assert!(t.ends_with("2024-03-01 09.30.05"));
    }

    #[test]
    fn video_path_is_date_partitioned() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 5).unwrap();
        let p = episode_video_path(Path::new("/data"), start, "My Doc 2024-03-01 09.30.05");
        assert_eq!(
            p,
            PathBuf::from("/data/2024/03/01/My Doc 2024-03-01 09.30.05.mp4")
        );
    }

    #[test]
    fn recent_files_filters_by_window() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("inside.txt");
        std::fs::write(&inside, "x").unwrap();

        let now = Utc::now();
        let hits = recent_files(dir.path(), now - Duration::minutes(5), now + Duration::minutes(5));
        assert!(hits.iter().any(|(p, _)| p == &inside));

        let misses = recent_files(
            dir.path(),
            now - Duration::days(10),
            now - Duration::days(9),
        );
        assert!(misses.is_empty());
    }

    #[test]
    fn recent_files_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        let now = Utc::now();
        let hits = recent_files(dir.path(), now - Duration::minutes(5), now + Duration::minutes(5));
        assert!(hits.is_empty());
    }
}
