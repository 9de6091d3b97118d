//! The ordered path → content map behind a snapshot, serialized as one
//! manifest document per commit.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use jam_backend::Backend;
use regex::Regex;
use tracing::{debug, instrument};

use crate::digests::ContentHash;
use crate::{framing, proto, streams, Error};

/// Outcome of a [Db::put].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutState {
    New,
    Changed,
    Unchanged,
}

#[derive(Default)]
pub struct Db {
    tree: BTreeMap<String, proto::Content>,
    changed: bool,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a serialized path database. Current writers produce one
    /// root page of entries, but branch pages referencing further
    /// serialized pages are followed too.
    #[instrument(skip(backend, document), err)]
    pub async fn load(backend: Arc<dyn Backend>, document: Vec<u8>) -> Result<Self, Error> {
        let mut db = Self::new();
        let mut documents = vec![document];
        while let Some(document) = documents.pop() {
            let payload = framing::open_document(&document)?;
            let mut cursor = &payload[..];
            while let Some(page) = proto::unmarshal_sized::<proto::Page>(&mut cursor)? {
                match page.descendents {
                    Some(proto::page::Descendents::Branch(stream)) => {
                        documents.push(streams::read_all(backend.clone(), &stream).await?);
                    }
                    Some(proto::page::Descendents::Entries(entries)) => {
                        for entry in entries.entries {
                            db.load_entry(entry)?;
                        }
                    }
                    None => {}
                }
            }
        }
        db.changed = false;
        Ok(db)
    }

    fn load_entry(&mut self, entry: proto::Entry) -> Result<(), Error> {
        let path = String::from_utf8(entry.path.to_vec())
            .map_err(|e| Error::Integrity(format!("non-utf8 manifest path: {}", e)))?;
        let mut content = entry
            .content
            .ok_or_else(|| Error::Integrity(format!("manifest entry {:?} without content", path)))?;
        if !content.hash.is_empty() {
            // normalizes legacy double-width hashes
            content.hash = ContentHash::try_from(content.hash.as_ref())?.to_bytes();
        }
        self.tree.insert(path, content);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&proto::Content> {
        self.tree.get(path)
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.tree
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .next()
            .map(|(path, _)| path.starts_with(prefix))
            .unwrap_or(false)
    }

    /// Visits paths starting with `prefix` in lexicographic order. When
    /// not recursive, a group of paths sharing a sub-directory collapses
    /// into a single visit of the directory path with no content.
    pub fn list(
        &self,
        prefix: &str,
        recursive: bool,
        mut visit: impl FnMut(&str, Option<&proto::Content>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut cursor = prefix.to_string();
        let mut inclusive = true;
        loop {
            let lower = if inclusive {
                Bound::Included(cursor.as_str())
            } else {
                Bound::Excluded(cursor.as_str())
            };
            let entry = self.tree.range::<str, _>((lower, Bound::Unbounded)).next();
            let Some((path, content)) = entry else {
                return Ok(());
            };
            if !path.starts_with(prefix) {
                return Ok(());
            }

            if !recursive {
                if let Some(idx) = path[prefix.len()..].find('/') {
                    let collapsed = &path[..prefix.len() + idx];
                    visit(collapsed, None)?;
                    // skip everything under the collapsed directory by
                    // seeking just past its trailing '/'
                    cursor = format!("{}0", collapsed);
                    inclusive = true;
                    continue;
                }
            }

            visit(path, Some(content))?;
            cursor = path.to_string();
            inclusive = false;
        }
    }

    pub fn put(&mut self, path: &str, content: proto::Content) -> PutState {
        match self.tree.get(path) {
            Some(existing) if *existing == content => PutState::Unchanged,
            existing => {
                let state = if existing.is_some() {
                    PutState::Changed
                } else {
                    PutState::New
                };
                self.tree.insert(path.to_string(), content);
                self.changed = true;
                state
            }
        }
    }

    pub fn delete(&mut self, path: &str) -> bool {
        if self.tree.remove(path).is_none() {
            return false;
        }
        debug!(%path, "deleted path");
        self.changed = true;
        true
    }

    /// Renames every matching path using
    /// [Regex::replace_all] semantics (the replacement may reference
    /// capture groups). Matching paths are collected first; the tree is
    /// never mutated while iterating.
    pub fn rename(&mut self, re: &Regex, replacement: &str) -> usize {
        let matches: Vec<String> = self
            .tree
            .keys()
            .filter(|path| re.is_match(path))
            .cloned()
            .collect();

        let mut moved = Vec::with_capacity(matches.len());
        for path in &matches {
            let content = self.tree.remove(path).expect("collected from tree");
            moved.push((re.replace_all(path, replacement).into_owned(), content));
        }
        for (path, content) in moved {
            self.tree.insert(path, content);
        }

        if !matches.is_empty() {
            self.changed = true;
        }
        matches.len()
    }

    /// Removes every path the predicate matches, returning the count.
    pub fn delete_all(&mut self, matches: impl Fn(&str) -> bool) -> usize {
        let doomed: Vec<String> = self
            .tree
            .keys()
            .filter(|path| matches(path))
            .cloned()
            .collect();
        for path in &doomed {
            self.tree.remove(path);
        }
        if !doomed.is_empty() {
            self.changed = true;
        }
        doomed.len()
    }

    /// Whether any state-mutating operation has happened since load (or
    /// the last [Db::mark_clean]).
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn mark_clean(&mut self) {
        self.changed = false;
    }

    /// Forces the next commit to write a manifest even though the tree
    /// matches what it was loaded from (used by revert-to, where the
    /// point is a fresh snapshot of an old state).
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Serializes the whole tree into one manifest document: a single
    /// root page holding every entry.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let entries = proto::EntrySet {
            entries: self
                .tree
                .iter()
                .map(|(path, content)| proto::Entry {
                    path: bytes::Bytes::copy_from_slice(path.as_bytes()),
                    content: Some(content.clone()),
                })
                .collect(),
        };
        let page = proto::Page {
            sort_key: String::new(),
            descendents: Some(proto::page::Descendents::Entries(entries)),
        };
        framing::seal_document(&proto::marshal_sized(&page))
    }
}
