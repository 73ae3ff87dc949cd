//! Filename helpers shared by the staging area and the folder repository.

use std::path::{Path, PathBuf};

/// Strip characters that are invalid in filenames on common filesystems.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect()
}

/// Insert a suffix between the stem and the extension.
///
/// `"photo.jpg"` with suffix `"abc"` becomes `"photo-abc.jpg"`. Without an
/// extension the suffix is simply appended.
pub fn insert_suffix(path: &str, suffix: &str) -> String {
    match path.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => {
            let (stem, ext) = path.split_at(dot_pos);
            let mut result = String::with_capacity(stem.len() + 1 + suffix.len() + ext.len());
            result.push_str(stem);
            result.push('-');
            result.push_str(suffix);
            result.push_str(ext);
            result
        }
        _ => {
            let mut result = String::with_capacity(path.len() + 1 + suffix.len());
            result.push_str(path);
            result.push('-');
            result.push_str(suffix);
            result
        }
    }
}

/// Directory name used for an album, both in staging and in folder libraries.
///
/// Leading dots are replaced so an album can never collide with marker files
/// or be mistaken for a hidden entry.
pub fn album_dir_name(album_name: &str) -> String {
    let clean = clean_filename(album_name.trim());
    if clean.is_empty() {
        return "_unnamed".to_string();
    }
    match clean.strip_prefix('.') {
        Some(rest) => format!("_{}", rest),
        None => clean,
    }
}

/// Staged filename for an asset; falls back to the asset id when the remote
/// filename is empty after cleaning.
pub fn staged_filename(filename: &str, asset_id: &str) -> String {
    let clean = clean_filename(filename);
    if clean.is_empty() || clean.starts_with('.') {
        return format!("{}{}", short_id(asset_id), clean);
    }
    clean
}

/// First eight characters of an id, used as a disambiguation suffix.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(id.len());
    &id[..end]
}

/// Whether a directory entry should be ignored (hidden files and markers).
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Names to try for `filename` in order: as is, with `suffix`, then with
/// `suffix` and a counter starting at 2.
pub fn candidate_names<'a>(filename: &'a str, suffix: &'a str) -> impl Iterator<Item = String> + 'a {
    std::iter::once(filename.to_string())
        .chain(std::iter::once(insert_suffix(filename, suffix)))
        .chain((2u32..).map(move |n| insert_suffix(filename, &format!("{}-{}", suffix, n))))
}

/// Pick a path in `dir` for `filename` that doesn't exist yet, inserting
/// `suffix` (and then a counter) on collision.
pub fn unique_path(dir: &Path, filename: &str, suffix: &str) -> PathBuf {
    candidate_names(filename, suffix)
        .map(|name| dir.join(name))
        .find(|path| !path.exists())
        .unwrap_or_else(|| dir.join(filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("a/b:c*d?.jpg"), "abcd.jpg");
        assert_eq!(clean_filename("normal.jpg"), "normal.jpg");
    }

    #[test]
    fn test_insert_suffix() {
        assert_eq!(insert_suffix("photo.jpg", "abc"), "photo-abc.jpg");
        assert_eq!(insert_suffix("photo", "abc"), "photo-abc");
        assert_eq!(insert_suffix("archive.tar.gz", "x"), "archive.tar-x.gz");
    }

    #[test]
    fn test_insert_suffix_dotfile_keeps_name() {
        assert_eq!(insert_suffix(".hidden", "x"), ".hidden-x");
    }

    #[test]
    fn test_album_dir_name() {
        assert_eq!(album_dir_name("Trip 2024"), "Trip 2024");
        assert_eq!(album_dir_name("a/b"), "ab");
        assert_eq!(album_dir_name(".active"), "_active");
        assert_eq!(album_dir_name("  "), "_unnamed");
    }

    #[test]
    fn test_staged_filename_falls_back_to_id() {
        assert_eq!(staged_filename("IMG_1.jpg", "abcdef0123"), "IMG_1.jpg");
        assert_eq!(staged_filename("///", "abcdef0123"), "abcdef01");
        assert_eq!(staged_filename(".jpg", "abcdef0123"), "abcdef01.jpg");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_is_hidden() {
        assert!(is_hidden(Path::new("/x/.active")));
        assert!(!is_hidden(Path::new("/x/photo.jpg")));
    }

    #[test]
    fn test_unique_path_suffixes_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "a.jpg", "id"), dir.path().join("a.jpg"));
        std::fs::write(dir.path().join("a.jpg"), b"1").unwrap();
        assert_eq!(unique_path(dir.path(), "a.jpg", "id"), dir.path().join("a-id.jpg"));
        std::fs::write(dir.path().join("a-id.jpg"), b"2").unwrap();
        assert_eq!(
            unique_path(dir.path(), "a.jpg", "id"),
            dir.path().join("a-id-2.jpg")
        );
    }

    #[test]
    fn test_candidate_names_order() {
        let names: Vec<String> = candidate_names("IMG.jpg", "abc").take(4).collect();
        assert_eq!(names, ["IMG.jpg", "IMG-abc.jpg", "IMG-abc-2.jpg", "IMG-abc-3.jpg"]);
    }
}
