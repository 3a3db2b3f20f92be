//! Listing model
//!
//! Converts raw store pages into display entries and gathers exhaustive
//! listings by following continuation tokens to the end.

use std::collections::HashSet;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::traits::{ListRequest, ListResult, ObjectInfo, ObjectStore};

/// Keys requested per page when paginating to exhaustion
pub const FULL_LISTING_PAGE_KEYS: i32 = 1000;

/// A folder or file row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub is_folder: bool,

    /// Full key (folders keep their trailing delimiter)
    pub key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<Timestamp>,

    pub display_name: String,
}

impl Entry {
    pub fn folder(prefix_key: &str, active_prefix: &str, delimiter: &str) -> Self {
        Self {
            is_folder: true,
            key: prefix_key.to_string(),
            size: None,
            modified_at: None,
            display_name: display_name(prefix_key, active_prefix, true, delimiter),
        }
    }

    pub fn file(info: &ObjectInfo, active_prefix: &str, delimiter: &str) -> Self {
        Self {
            is_folder: false,
            key: info.key.clone(),
            size: info.size_bytes,
            modified_at: info.last_modified,
            display_name: display_name(&info.key, active_prefix, false, delimiter),
        }
    }

    /// Human-readable size, empty for folders and unknown sizes
    pub fn size_display(&self) -> String {
        match self.size {
            Some(size) if !self.is_folder => {
                humansize::format_size(size.max(0) as u64, humansize::BINARY)
            }
            _ => String::new(),
        }
    }
}

/// What the host draws for a row index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Data(Entry),
    /// Not loaded yet; never carries data
    Placeholder,
}

impl Row {
    pub fn entry(&self) -> Option<&Entry> {
        match self {
            Row::Data(entry) => Some(entry),
            Row::Placeholder => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Row::Placeholder)
    }
}

/// One converted page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub entries: Vec<Entry>,
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

impl ListingPage {
    /// Folders first, then files; folder markers are dropped
    pub fn from_result(result: ListResult, active_prefix: &str, delimiter: &str) -> Self {
        let mut entries = Vec::with_capacity(result.common_prefixes.len() + result.objects.len());
        entries.extend(
            result
                .common_prefixes
                .iter()
                .map(|p| Entry::folder(p, active_prefix, delimiter)),
        );
        entries.extend(
            result
                .objects
                .iter()
                .filter(|o| !is_folder_marker(&o.key, delimiter))
                .map(|o| Entry::file(o, active_prefix, delimiter)),
        );

        let is_truncated = result.truncated;
        Self {
            entries,
            next_continuation_token: if is_truncated {
                result.continuation_token
            } else {
                None
            },
            is_truncated,
        }
    }
}

/// Every folder and file under a prefix, across all pages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullListing {
    /// Full folder prefixes
    pub folders: Vec<String>,
    pub files: Vec<ObjectInfo>,
}

impl FullListing {
    pub fn len(&self) -> usize {
        self.folders.len() + self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    /// Display entries, folders first
    pub fn entries(&self, active_prefix: &str, delimiter: &str) -> Vec<Entry> {
        self.folders
            .iter()
            .map(|p| Entry::folder(p, active_prefix, delimiter))
            .chain(
                self.files
                    .iter()
                    .map(|f| Entry::file(f, active_prefix, delimiter)),
            )
            .collect()
    }
}

/// A key that only exists to make a folder visible
pub fn is_folder_marker(key: &str, delimiter: &str) -> bool {
    !delimiter.is_empty() && key.ends_with(delimiter)
}

/// Strip the active prefix; folders also lose their trailing delimiter
pub fn display_name(key: &str, active_prefix: &str, is_folder: bool, delimiter: &str) -> String {
    let name = key.strip_prefix(active_prefix).unwrap_or(key);
    let name = if is_folder && !delimiter.is_empty() {
        name.strip_suffix(delimiter).unwrap_or(name)
    } else {
        name
    };
    name.to_string()
}

/// Parent prefix of a key (`"a/b/c.txt"` -> `"a/b/"`, `"a/b/"` -> `"a/"`)
pub fn parent_prefix(key: &str, delimiter: &str) -> String {
    let trimmed = key.strip_suffix(delimiter).unwrap_or(key);
    match trimmed.rfind(delimiter) {
        Some(pos) => trimmed[..pos + delimiter.len()].to_string(),
        None => String::new(),
    }
}

/// Follow continuation tokens until the listing is exhausted.
///
/// Duplicate folders or keys across pages are kept once.
pub async fn fetch_full_listing(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    delimiter: &str,
) -> Result<FullListing> {
    let mut listing = FullListing::default();
    let mut seen_folders = HashSet::new();
    let mut seen_files = HashSet::new();
    let mut continuation_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let request = ListRequest::new(bucket, prefix)
            .delimiter(delimiter)
            .max_keys(FULL_LISTING_PAGE_KEYS)
            .continuation_token(continuation_token.take());

        let result = store.list_objects(request).await?;
        pages += 1;

        for folder in result.common_prefixes {
            if seen_folders.insert(folder.clone()) {
                listing.folders.push(folder);
            }
        }

        for object in result.objects {
            if is_folder_marker(&object.key, delimiter) {
                continue;
            }
            if seen_files.insert(object.key.clone()) {
                listing.files.push(object);
            }
        }

        match result.continuation_token {
            Some(token) if result.truncated => continuation_token = Some(token),
            _ => break,
        }
    }

    tracing::debug!(
        bucket = %bucket,
        prefix = %prefix,
        pages,
        folders = listing.folders.len(),
        files = listing.files.len(),
        "Fetched full listing"
    );

    Ok(listing)
}

/// Every object below `prefix` at any depth, folder markers left out.
///
/// Lists without a delimiter, so nested keys come back flat.
pub async fn fetch_all_objects(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    delimiter: &str,
) -> Result<Vec<ObjectInfo>> {
    let mut objects = Vec::new();
    let mut seen = HashSet::new();
    let mut continuation_token: Option<String> = None;

    loop {
        let request = ListRequest::new(bucket, prefix)
            .max_keys(FULL_LISTING_PAGE_KEYS)
            .continuation_token(continuation_token.take());
        let result = store.list_objects(request).await?;

        for object in result.objects {
            if !is_folder_marker(&object.key, delimiter) && seen.insert(object.key.clone()) {
                objects.push(object);
            }
        }

        match result.continuation_token {
            Some(token) if result.truncated => continuation_token = Some(token),
            _ => break,
        }
    }

    tracing::debug!(
        bucket = %bucket,
        prefix = %prefix,
        objects = objects.len(),
        "Fetched all objects"
    );
    Ok(objects)
}
