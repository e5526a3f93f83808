//! Path normalization (spec §3): `/`-separated, NFKC-normalized, with a
//! reserved temp-file predicate used to short-circuit caching/sync.

use unicode_normalization::UnicodeNormalization;

/// Normalizes a share-relative path for comparison and storage.
///
/// Collapses a leading/trailing `/`, and applies Unicode NFKC normalization
/// to each segment unless `normalize` is false (the `noUnicodeNormalize`
/// config switch in spec §6).
pub fn normalize_path(path: &str, normalize: bool) -> String {
    let trimmed = path.trim_matches('/');
    if !normalize {
        return trimmed.to_string();
    }
    trimmed.nfkc().collect::<String>()
}

/// True for names FUSE/editor clients use as scratch files that must never
/// be cached or synced (spec §3, §4.E "Temp-file paths").
pub fn is_temp_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.is_empty() {
        return false;
    }
    name.starts_with('.')
        || name.starts_with("~$")
        || (name.starts_with('.') && name.ends_with(".swp"))
        || name.ends_with(".swp")
        || name.ends_with(".swx")
        || name.ends_with('~')
        || name == "Thumbs.db"
        || name == ".DS_Store"
}

/// Splits a normalized path into `(parent, name)`. The root's parent is `""`.
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// True if `candidate` is `prefix` itself or nested under it.
pub fn is_under_prefix(candidate: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    candidate == prefix || candidate.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_slashes() {
        assert_eq!(normalize_path("/a/b/", true), "a/b");
    }

    #[test]
    fn nfkc_normalizes() {
        // U+FB01 LATIN SMALL LIGATURE FI -> "fi"
        let composed = "\u{FB01}le.txt";
        assert_eq!(normalize_path(composed, true), "file.txt");
    }

    #[test]
    fn normalize_disabled_is_identity_modulo_slashes() {
        let composed = "\u{FB01}le.txt";
        assert_eq!(normalize_path(composed, false), composed);
    }

    #[test]
    fn detects_temp_files() {
        assert!(is_temp_file("dir/.hidden"));
        assert!(is_temp_file("dir/~$report.docx"));
        assert!(is_temp_file("dir/foo.swp"));
        assert!(!is_temp_file("dir/report.docx"));
    }

    #[test]
    fn prefix_matching() {
        assert!(is_under_prefix("a/b/c", "a/b"));
        assert!(is_under_prefix("a/b", "a/b"));
        assert!(!is_under_prefix("a/bc", "a/b"));
    }
}
