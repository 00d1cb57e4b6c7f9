//! Supported audio formats and path derivation.
//!
//! The bronze path filter and the silver extension check are both built from
//! the same extension list, so a file admitted by discovery is judged by the
//! same rules during enrichment.

/// Audio extensions accepted by the pipeline (lowercase, without the dot)
pub const SUPPORTED_EXTENSIONS: [&str; 6] = ["wav", "mp3", "flac", "m4a", "ogg", "mp4"];

/// Default extension list as owned strings (for configuration defaults)
pub fn default_extensions() -> Vec<String> {
    SUPPORTED_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

/// Build the file-name glob for a set of extensions, e.g. `*.{wav,mp3}`
pub fn path_glob_filter(extensions: &[String]) -> String {
    match extensions {
        [single] => format!("*.{}", single),
        _ => format!("*.{{{}}}", extensions.join(",")),
    }
}

/// Final path segment (everything after the last `/`).
///
/// A path ending in `/` yields an empty name.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Lowercased suffix after the last `.` of the file name.
///
/// Returns an empty string when the name has no `.` or ends with one.
pub fn file_extension(path: &str) -> String {
    let name = file_name(path);
    match name.rfind('.') {
        Some(idx) => name[idx + 1..].to_lowercase(),
        None => String::new(),
    }
}

/// Check an already-derived extension against an allow list
pub fn is_supported(extension: &str, extensions: &[String]) -> bool {
    !extension.is_empty() && extensions.iter().any(|e| e == extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_is_last_segment() {
        assert_eq!(file_name("/Volumes/main/stt/files/a.wav"), "a.wav");
        assert_eq!(file_name("a.wav"), "a.wav");
        assert_eq!(file_name("/Volumes/main/stt/files/"), "");
    }

    #[test]
    fn test_extension_lowercased() {
        assert_eq!(file_extension("/x/a.WAV"), "wav");
        assert_eq!(file_extension("/x/b.wav"), "wav");
        assert_eq!(file_extension("/x/c.txt"), "txt");
    }

    #[test]
    fn test_extension_missing_or_trailing_dot() {
        assert_eq!(file_extension("/x/d"), "");
        assert_eq!(file_extension("/x/d."), "");
        // A dot in a directory name does not leak into the extension
        assert_eq!(file_extension("/x/dir.v2/d"), "");
    }

    #[test]
    fn test_extension_uses_last_dot() {
        assert_eq!(file_extension("/x/clip.final.mp3"), "mp3");
        assert_eq!(file_name("/x/clip.final.mp3"), "clip.final.mp3");
        assert_eq!(file_extension("a.b.wav"), "wav");
    }

    #[test]
    fn test_glob_filter_covers_all_extensions() {
        assert_eq!(
            path_glob_filter(&default_extensions()),
            "*.{wav,mp3,flac,m4a,ogg,mp4}"
        );
        assert_eq!(path_glob_filter(&["wav".to_string()]), "*.wav");
    }

    #[test]
    fn test_is_supported() {
        let exts = default_extensions();
        assert!(is_supported("wav", &exts));
        assert!(is_supported("mp4", &exts));
        assert!(!is_supported("txt", &exts));
        assert!(!is_supported("", &exts));
    }
}
