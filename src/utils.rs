//! Utility functions for save path handling

use crate::config::StorageConfig;
use std::path::PathBuf;

/// Characters that are not allowed in a directory name on common filesystems
const ILLEGAL_CHARS: &[char] = &[':', '*', '?', '"', '<', '>', '|', '\''];

/// Turn a series name (or URL) into a relative path
///
/// URL schemes become a leading directory (`https://a/b` → `https/a/b`),
/// characters illegal in file names are removed, and empty, `.` and `..`
/// components are dropped so the result always stays below the save root.
///
/// # Examples
///
/// ```
/// use bangumi_dl::utils::normalize_path;
///
/// assert_eq!(normalize_path("Re:Zero"), "ReZero");
/// assert_eq!(normalize_path("../x"), "x");
/// assert_eq!(normalize_path("https://example.com/a.jpg"), "https/example.com/a.jpg");
/// ```
pub fn normalize_path(name: &str) -> String {
    let name = name
        .replace("http://", "http/")
        .replace("https://", "https/");
    let cleaned: String = name.chars().filter(|c| !ILLEGAL_CHARS.contains(c)).collect();

    cleaned
        .split(['/', '\\'])
        .filter(|part| !matches!(*part, "" | "." | ".."))
        .collect::<Vec<_>>()
        .join("/")
}

/// Directory episodes of `series_name` are downloaded into
///
/// An entry in `save_path_map` (keyed by the normalized name) wins; a
/// relative entry is resolved against `save_path`.
pub fn save_path_for(storage: &StorageConfig, series_name: &str) -> PathBuf {
    let name = normalize_path(series_name);

    match storage.save_path_map.get(&name) {
        None => storage.save_path.join(name),
        Some(mapped) if mapped.is_absolute() => mapped.clone(),
        Some(mapped) => storage.save_path.join(mapped),
    }
}
