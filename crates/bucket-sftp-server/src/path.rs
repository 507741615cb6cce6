//! Client path canonicalization.
//!
//! SFTP clients speak in absolute, slash-separated paths. Object keys are
//! relative to the bucket, so `/a/./b/` becomes the key `a/b` and the bucket
//! root becomes the empty string.

/// Canonicalize a client path into an object key.
///
/// Leading separators are dropped, `.` and empty segments vanish, `..` pops
/// the previous segment and is clamped at the bucket root. The result never
/// starts or ends with `/`, and `normalize(normalize(p)) == normalize(p)`.
pub fn normalize(path: &str) -> String {
    segments(path).join("/")
}

/// Resolve a path for REALPATH.
///
/// Same rules as [`normalize`], but the answer stays absolute: `.`, `..` and
/// the empty path all resolve to `/`, and relative paths resolve against the
/// root.
pub fn real_path(path: &str) -> String {
    format!("/{}", segments(path).join("/"))
}

/// Listing prefix for the children of a normalized directory key.
pub fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

/// Key of the zero-length object marking a directory.
pub fn marker_key(key: &str) -> String {
    format!("{key}/")
}

fn segments(path: &str) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize("/a/./b/"), "a/b");
        assert_eq!(normalize("a/b/."), "a/b");
        assert_eq!(normalize("/a/b"), "a/b");
        assert_eq!(normalize("."), "");
        assert_eq!(normalize(".."), "");
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_collapses() {
        assert_eq!(normalize("//a//b///c"), "a/b/c");
        assert_eq!(normalize("/a/b/../c"), "a/c");
        assert_eq!(normalize("/../../etc/passwd"), "etc/passwd");
        assert_eq!(normalize("file."), "file.");
        assert_eq!(normalize("a/.hidden"), "a/.hidden");
    }

    #[test]
    fn test_normalize_idempotent() {
        let inputs = [
            "", "/", ".", "..", "/a/./b/", "a/b/.", "x/../../y", "//q//", "a/b..", "file.",
            "/..a/b../.c", "a/./../b/./c/..",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "not idempotent for {input:?}");
            assert!(!once.starts_with('/') && !once.ends_with('/'));
        }
    }

    #[test]
    fn test_real_path() {
        assert_eq!(real_path("."), "/");
        assert_eq!(real_path(".."), "/");
        assert_eq!(real_path(""), "/");
        assert_eq!(real_path("/a/b/../c/"), "/a/c");
        assert_eq!(real_path("docs"), "/docs");
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(dir_prefix(""), "");
        assert_eq!(dir_prefix("a/b"), "a/b/");
        assert_eq!(marker_key("a"), "a/");
    }
}
