//! Scanner module for discovering video files in library directories.
//!
//! This module recursively scans configured library roots for video files, filtering by
//! the configured extensions and leaving out in-progress outputs of the publisher.

use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::publish::is_temp_artifact;

/// A candidate video file discovered during library scanning.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    /// Full path to the video file.
    pub path: PathBuf,
}

/// Checks if a file has one of `extensions` (case-insensitive, given with leading dot).
pub fn is_video_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        })
        .unwrap_or(false)
}

/// Scans the given library roots for video files.
///
/// This function:
/// - Recursively walks each library root directory, warning about missing roots
/// - Skips hidden directories (names starting with `.`) below the root
/// - Filters files by video extensions (case-insensitive)
/// - Excludes temporary outputs (`*.normalised.tmp*`)
pub fn scan_libraries(roots: &[PathBuf], extensions: &[String]) -> Vec<ScanCandidate> {
    let mut candidates = Vec::new();

    for root in roots {
        if !root.is_dir() {
            warn!(root = %root.display(), "library root missing, skipping");
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with('.') {
                        return false;
                    }
                }
            }
            true
        });

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();

            if !entry.file_type().is_file() {
                continue;
            }

            if !is_video_file(path, extensions) || is_temp_artifact(path) {
                continue;
            }

            candidates.push(ScanCandidate {
                path: path.to_path_buf(),
            });
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LibraryConfig;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn default_extensions() -> Vec<String> {
        LibraryConfig::default().video_extensions
    }

    #[test]
    fn test_is_video_file() {
        let exts = default_extensions();
        assert!(is_video_file(Path::new("/media/movie.mkv"), &exts));
        assert!(is_video_file(Path::new("/media/movie.MKV"), &exts));
        assert!(is_video_file(Path::new("/media/movie.Mp4"), &exts));
        assert!(is_video_file(Path::new("/media/movie.m4v"), &exts));
        assert!(!is_video_file(Path::new("/media/movie.avi"), &exts));
        assert!(!is_video_file(Path::new("/media/movie.srt"), &exts));
        assert!(!is_video_file(Path::new("/media/movie"), &exts));
    }

    #[test]
    fn test_scan_excludes_temp_outputs_and_backups() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        File::create(root.join("film.mkv")).unwrap();
        File::create(root.join("film.normalised.tmp.mkv")).unwrap();
        File::create(root.join("film.mkv.bak")).unwrap();
        File::create(root.join("notes.txt")).unwrap();

        let candidates = scan_libraries(&[root.to_path_buf()], &default_extensions());

        let paths: Vec<_> = candidates.iter().map(|c| c.path.clone()).collect();
        assert_eq!(paths, vec![root.join("film.mkv")]);
    }

    #[test]
    fn test_scan_skips_missing_roots() {
        let temp_dir = TempDir::new().unwrap();
        let present = temp_dir.path().join("tv");
        fs::create_dir_all(&present).unwrap();
        fs::write(present.join("episode.mp4"), b"1234").unwrap();

        let candidates = scan_libraries(
            &[temp_dir.path().join("movies"), present.clone()],
            &default_extensions(),
        );

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path, present.join("episode.mp4"));
    }

    // Property: a path is a candidate iff its extension is configured, in any case.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_video_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("mkv"), Just("MKV"), Just("Mkv"),
                Just("mp4"), Just("MP4"),
                Just("mov"), Just("MOV"),
                Just("m4v"), Just("M4V"),
                Just("avi"), Just("ts"), Just("txt"), Just("jpg"), Just("srt"), Just("bak"),
            ],
        ) {
            let path = PathBuf::from(format!("/media/{}.{}", basename, ext));
            let expected = matches!(ext.to_lowercase().as_str(), "mkv" | "mp4" | "mov" | "m4v");
            prop_assert_eq!(is_video_file(&path, &default_extensions()), expected);
        }
    }

    // Property: files below hidden directories are never returned.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_hidden_directory_exclusion(
            visible_dir in "[a-zA-Z0-9]{1,10}",
            hidden_dir in "\\.[a-zA-Z0-9]{1,10}",
            filename in "[a-zA-Z0-9]{1,10}",
        ) {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path();

            let visible_path = root.join(&visible_dir);
            fs::create_dir_all(&visible_path).unwrap();
            let visible_video = visible_path.join(format!("{}.mkv", filename));
            File::create(&visible_video).unwrap();

            let hidden_path = root.join(&hidden_dir);
            fs::create_dir_all(&hidden_path).unwrap();
            let hidden_video = hidden_path.join(format!("{}.mkv", filename));
            File::create(&hidden_video).unwrap();

            let candidates = scan_libraries(&[root.to_path_buf()], &default_extensions());

            prop_assert!(candidates.iter().any(|c| c.path == visible_video));
            prop_assert!(!candidates.iter().any(|c| c.path == hidden_video));
        }
    }
}
