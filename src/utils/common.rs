//! Common utility functions used across the library

use std::path::Path;

/// Sanitize filename to be safe for all operating systems.
/// Converts the filename to lowercase and replaces special characters with underscores.
pub fn sanitize_filename(input: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', ' ', '\t'];
    let mut result = input.to_lowercase();
    for c in invalid_chars {
        result = result.replace(c, "_");
    }
    result
}

/// Check if a file exists and has valid content (non-zero size)
pub async fn check_file_exists_and_valid(path: &Path) -> bool {
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        if metadata.is_file() && metadata.len() > 0 {
            return true;
        }
    }
    false
}

/// Stable cache key for a piece of text, used to name regeneratable artifacts.
pub fn content_key(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Hello World"), "hello_world");
        assert_eq!(
            sanitize_filename("File:Name?With*Special<Chars>"),
            "file_name_with_special_chars_"
        );
        assert_eq!(sanitize_filename("UPPERCASE"), "uppercase");
        assert_eq!(sanitize_filename("path/to/file"), "path_to_file");
    }

    #[test]
    fn test_content_key_stable() {
        assert_eq!(content_key("hello"), content_key("hello"));
        assert_ne!(content_key("hello"), content_key("hello "));
        assert_eq!(content_key("hello").len(), 32);
    }

    #[tokio::test]
    async fn test_check_file_exists_and_valid() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        assert!(!check_file_exists_and_valid(&missing).await);

        let empty = dir.path().join("empty.txt");
        tokio::fs::write(&empty, b"").await.unwrap();
        assert!(!check_file_exists_and_valid(&empty).await);

        let valid = dir.path().join("valid.txt");
        tokio::fs::write(&valid, b"data").await.unwrap();
        assert!(check_file_exists_and_valid(&valid).await);
    }
}
