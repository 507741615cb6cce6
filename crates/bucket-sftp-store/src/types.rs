//! Object store types.

use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of entry returned by a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A stored object (including zero-length directory markers).
    Object,
    /// A common prefix synthesized by a delimiter-bounded listing.
    Prefix,
}

/// Object metadata as returned by `head` and `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object key, relative to the bucket.
    pub key: String,
    /// Object or synthesized prefix.
    pub kind: EntryKind,
    /// Size in bytes. Always 0 for prefixes.
    pub size: u64,
    /// Creation time.
    pub created: SystemTime,
    /// Last update time.
    pub updated: SystemTime,
}

impl ObjectMeta {
    /// Metadata for a stored object.
    pub fn object(key: impl Into<String>, size: u64, created: SystemTime, updated: SystemTime) -> Self {
        Self {
            key: key.into(),
            kind: EntryKind::Object,
            size,
            created,
            updated,
        }
    }

    /// Metadata for a synthesized common prefix.
    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: EntryKind::Prefix,
            size: 0,
            created: UNIX_EPOCH,
            updated: UNIX_EPOCH,
        }
    }

    /// Returns true for synthesized prefixes.
    pub fn is_prefix(&self) -> bool {
        self.kind == EntryKind::Prefix
    }
}

/// A prefix listing request.
///
/// With a delimiter, keys that contain the delimiter after `prefix` are rolled
/// up into a single [`EntryKind::Prefix`] entry ending in the delimiter, like
/// a cloud bucket's `delimiter` query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub prefix: String,
    pub delimiter: Option<char>,
    /// Report objects whose names end in the delimiter (directory markers)
    /// as objects instead of folding them into their prefix.
    pub include_trailing_delimiter: bool,
    /// Upper bound on returned entries. `None` means one backend page.
    pub max_results: Option<usize>,
}

impl ListQuery {
    /// Delimiter-bounded listing of one "directory" level under `prefix`.
    pub fn directory(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: Some('/'),
            include_trailing_delimiter: true,
            max_results: None,
        }
    }

    /// Cap the number of returned entries.
    pub fn limit(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }
}

/// One page of listing results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ObjectMeta>,
    /// More entries matched than were returned.
    pub truncated: bool,
}

impl ListPage {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Accumulates listing results, folding keys into common prefixes.
///
/// Shared by the backends so that both apply the same delimiter rules.
/// Keys must be fed in lexicographic order.
#[derive(Debug)]
pub(crate) struct ListingBuilder<'q> {
    query: &'q ListQuery,
    limit: usize,
    last_prefix: Option<String>,
    page: ListPage,
}

impl<'q> ListingBuilder<'q> {
    pub(crate) fn new(query: &'q ListQuery, page_size: usize) -> Self {
        Self {
            query,
            limit: query.max_results.unwrap_or(page_size),
            last_prefix: None,
            page: ListPage::default(),
        }
    }

    /// Offer one key. Returns false once the page is full.
    ///
    /// `meta` is only invoked when the key is reported as an object.
    pub(crate) fn offer(&mut self, key: &str, meta: impl FnOnce() -> ObjectMeta) -> bool {
        let Some(rest) = key.strip_prefix(self.query.prefix.as_str()) else {
            return true;
        };

        let split = self
            .query
            .delimiter
            .and_then(|d| rest.find(d).map(|i| (i, d.len_utf8())));

        let entry = match split {
            None => meta(),
            Some((i, width)) => {
                let common = &key[..self.query.prefix.len() + i + width];
                if self.last_prefix.as_deref() == Some(common) {
                    return true;
                }
                self.last_prefix = Some(common.to_string());
                let is_marker = i + width == rest.len();
                if is_marker && self.query.include_trailing_delimiter {
                    meta()
                } else {
                    ObjectMeta::prefix(common)
                }
            }
        };

        if self.page.entries.len() >= self.limit {
            self.page.truncated = true;
            return false;
        }
        self.page.entries.push(entry);
        true
    }

    pub(crate) fn finish(self) -> ListPage {
        self.page
    }
}
