use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

const PLACEHOLDER: char = '_';
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];
const TRANSCODED_EXTENSION: &str = "jpg";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("local name is empty")]
    Empty,
    #[error("local name {0:?} does not stay inside the cache directory")]
    Escapes(String),
}

/// Reduces a remote display name to a single, filesystem-legal path component.
///
/// Directory parts are dropped, `..` sequences and illegal or control
/// characters become `_`. Empty and dot-only results are replaced by a name
/// derived from a hash of the input, so the same remote name maps to the same
/// local name on every cycle.
pub fn sanitize_file_name(raw: &str) -> String {
    let trimmed = raw.trim_end_matches(['/', '\\']);
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    if base.chars().all(|c| c == '.') {
        return format!("unnamed_{}", short_hash(raw));
    }
    let mut safe: String = base
        .replace("..", "_")
        .chars()
        .map(|c| {
            if c.is_control() || ILLEGAL_CHARS.contains(&c) {
                PLACEHOLDER
            } else {
                c
            }
        })
        .collect();

    if is_device_name(&safe) {
        safe.insert(0, PLACEHOLDER);
    }
    safe
}

/// Local cache name for a sanitized display name. Transcoded photos are
/// always stored as JPEG.
pub fn local_name_for(display_name: &str, transcode: bool) -> String {
    let safe = sanitize_file_name(display_name);
    if !transcode {
        return safe;
    }
    let stem = match safe.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => safe.as_str(),
    };
    format!("{stem}.{TRANSCODED_EXTENSION}")
}

/// Assigns collision-free local names to `(href, display_name)` pairs.
///
/// Pairs are visited in href order: the first claimant of a name keeps it,
/// later ones get a suffix from a hash of their href. Output order matches
/// input order.
pub fn assign_local_names<'a, I>(items: I, transcode: bool) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let items: Vec<(&str, String)> = items
        .into_iter()
        .map(|(href, display_name)| (href, local_name_for(display_name, transcode)))
        .collect();
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|a, b| items[*a].0.cmp(items[*b].0));

    let mut taken = HashSet::with_capacity(items.len());
    let mut names = vec![String::new(); items.len()];
    for index in order {
        let (href, base) = &items[index];
        let mut candidate = base.clone();
        let mut salt = 0u32;
        while !taken.insert(candidate.clone()) {
            let seed = if salt == 0 {
                (*href).to_string()
            } else {
                format!("{href}#{salt}")
            };
            candidate = with_suffix(base, &short_hash(&seed));
            salt += 1;
        }
        names[index] = candidate;
    }
    names
}

/// Resolves `local_name` under `cache_root`, accepting only a single plain
/// path component.
pub fn cache_path_for(cache_root: &Path, local_name: &str) -> Result<PathBuf, PathError> {
    if local_name.is_empty() {
        return Err(PathError::Empty);
    }
    if local_name.contains('\0') {
        return Err(PathError::Escapes(local_name.to_string()));
    }

    let mut components = Path::new(local_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => Ok(cache_root.join(part)),
        _ => Err(PathError::Escapes(local_name.to_string())),
    }
}

pub fn short_hash(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn with_suffix(name: &str, suffix: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{suffix}.{ext}"),
        _ => format!("{name}-{suffix}"),
    }
}

fn is_device_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    DEVICE_NAMES
        .iter()
        .any(|device| stem.eq_ignore_ascii_case(device))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOSTILE: &[&str] = &[
        "../../etc/passwd",
        "..",
        ".",
        "",
        "/",
        "/absolute/path.jpg",
        "C:\\Windows\\system32\\evil.png",
        "a/../../b.jpg",
        "nul\0byte.jpg",
        "tab\tname.jpg",
        "...",
        "....//....//x",
        "con",
        "NUL.jpg",
        "what?.jpg",
        "photo.jpg/",
    ];

    #[test]
    fn sanitized_names_always_resolve_inside_cache_root() {
        let root = PathBuf::from("/cache");
        for raw in HOSTILE {
            let name = sanitize_file_name(raw);
            let resolved = cache_path_for(&root, &name)
                .unwrap_or_else(|err| panic!("{raw:?} -> {name:?} rejected: {err}"));
            assert_eq!(resolved.parent(), Some(root.as_path()), "{raw:?}");
            assert_ne!(resolved, root, "{raw:?}");
        }
    }

    #[test]
    fn keeps_ordinary_names() {
        assert_eq!(sanitize_file_name("Beach Day.jpg"), "Beach Day.jpg");
        assert_eq!(sanitize_file_name("árvíztűrő.png"), "árvíztűrő.png");
    }

    #[test]
    fn strips_directories_and_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("a\\b\\c.jpg"), "c.jpg");
        assert_eq!(sanitize_file_name("x..y.jpg"), "x_y.jpg");
        assert_eq!(sanitize_file_name("nul\0byte.jpg"), "nul_byte.jpg");
        assert_eq!(sanitize_file_name("photo.jpg/"), "photo.jpg");
    }

    #[test]
    fn generated_names_are_stable() {
        let first = sanitize_file_name("..");
        assert!(first.starts_with("unnamed_"));
        assert_eq!(first, sanitize_file_name(".."));
        assert_ne!(first, sanitize_file_name(""));
        assert!(sanitize_file_name(".").starts_with("unnamed_"));
        assert!(sanitize_file_name("....").starts_with("unnamed_"));
        assert!(sanitize_file_name("album/..").starts_with("unnamed_"));
    }

    #[test]
    fn prefixes_device_names() {
        assert_eq!(sanitize_file_name("con"), "_con");
        assert_eq!(sanitize_file_name("NUL.jpg"), "_NUL.jpg");
        assert_eq!(sanitize_file_name("console.jpg"), "console.jpg");
    }

    #[test]
    fn cache_path_rejects_anything_but_one_component() {
        let root = PathBuf::from("/cache");
        assert_eq!(cache_path_for(&root, ""), Err(PathError::Empty));
        for name in ["..", ".", "../x", "/etc/passwd", "a/b", "a\0b"] {
            assert!(
                matches!(cache_path_for(&root, name), Err(PathError::Escapes(_))),
                "{name:?} should be rejected"
            );
        }
        assert_eq!(
            cache_path_for(&root, "a.jpg").unwrap(),
            PathBuf::from("/cache/a.jpg")
        );
    }

    #[test]
    fn transcoded_names_use_jpg_extension() {
        assert_eq!(local_name_for("IMG_1.png", true), "IMG_1.jpg");
        assert_eq!(local_name_for("IMG_1.png", false), "IMG_1.png");
        assert_eq!(local_name_for("archive.tar.gz", true), "archive.tar.jpg");
        assert_eq!(local_name_for(".hidden", true), ".hidden.jpg");
    }

    #[test]
    fn colliding_names_are_disambiguated_by_href() {
        let items = [
            ("/dav/mirror/b.png", "b.png"),
            ("/dav/mirror/a.png", "a.png"),
            ("/dav/mirror/a.jpg", "a.jpg"),
        ];
        let names = assign_local_names(items, true);

        assert_eq!(names[0], "b.jpg");
        // "/dav/mirror/a.jpg" sorts first and keeps the plain name.
        assert_eq!(names[2], "a.jpg");
        assert_eq!(
            names[1],
            format!("a-{}.jpg", short_hash("/dav/mirror/a.png"))
        );

        let again = assign_local_names(items, true);
        assert_eq!(names, again);
    }
}
