// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dense tag-id bookkeeping: the muxer-wide [`TagTable`] and the
//! per-connection [`TagTranslator`].

use std::collections::HashMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Name of the reserved tag that every translator passes through untranslated.
pub const GRAVWELL_TAG_NAME: &str = "gravwell";

/// Dense index into the muxer's [`TagTable`]; stable process-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalTagId(pub u32);

/// Indexer-assigned dense index; stable only for the connection that assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteTagId(pub u32);

/// The reserved local id for [`GRAVWELL_TAG_NAME`]; always index 0.
pub const GRAVWELL_TAG: LocalTagId = LocalTagId(0);
/// The reserved remote id every indexer agrees corresponds to [`GRAVWELL_TAG_NAME`].
pub const GRAVWELL_REMOTE_TAG: RemoteTagId = RemoteTagId(0);

/// Validates a tag name's character set.
///
/// Gravwell-style tags are short, printable, non-empty identifiers; this
/// mirrors the `CheckTag` delegate referenced (but not specified) by the
/// ingest muxer spec. Allowed: ASCII alphanumerics, `-`, `_`, `.`; 1-64 bytes.
pub fn check_tag(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("tag name must not be empty");
    }
    if name.len() > 64 {
        bail!("tag name {name:?} exceeds the 64 byte limit");
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        bail!("tag name {name:?} contains characters outside [A-Za-z0-9._-]");
    }
    Ok(())
}

/// Muxer-owned, monotonically growing table mapping tag names to
/// [`LocalTagId`]s. The index of a name IS its `LocalTagId`; the table never
/// shrinks while the muxer is running.
#[derive(Debug, Clone, Default)]
pub struct TagTable {
    tags: Vec<String>,
    tag_map: HashMap<String, LocalTagId>,
}

impl TagTable {
    /// Builds a table pre-seeded with the reserved "gravwell" tag at index 0,
    /// plus every name in `initial`.
    pub fn new<I: IntoIterator<Item = String>>(initial: I) -> Result<Self> {
        let mut t = Self::default();
        t.push(GRAVWELL_TAG_NAME.to_string());
        for name in initial {
            if name == GRAVWELL_TAG_NAME {
                continue;
            }
            check_tag(&name)?;
            if !t.tag_map.contains_key(&name) {
                t.push(name);
            }
        }
        Ok(t)
    }

    fn push(&mut self, name: String) -> LocalTagId {
        let id = LocalTagId(self.tags.len() as u32);
        self.tag_map.insert(name.clone(), id);
        self.tags.push(name);
        id
    }

    pub fn get(&self, name: &str) -> Option<LocalTagId> {
        self.tag_map.get(name).copied()
    }

    /// Expensive, linear reverse lookup; only meant for diagnostics.
    pub fn lookup(&self, id: LocalTagId) -> Option<&str> {
        self.tags.get(id.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.tags
    }

    /// Idempotent insert: returns the existing id if `name` is already
    /// present, otherwise appends and returns the new id.
    pub fn negotiate(&mut self, name: &str) -> Result<(LocalTagId, bool)> {
        if let Some(id) = self.get(name) {
            return Ok((id, false));
        }
        check_tag(name)?;
        Ok((self.push(name.to_string()), true))
    }
}

/// Per-connection bijection between [`LocalTagId`] and [`RemoteTagId`].
///
/// `tt[i]` is the remote id this connection's indexer returned when asked for
/// `tags[i]`; `len(tt) <= len(tags)` always holds.
#[derive(Debug, Clone, Default)]
pub struct TagTranslator {
    tt: Vec<RemoteTagId>,
}

impl TagTranslator {
    pub fn new() -> Self {
        Self {
            tt: vec![GRAVWELL_REMOTE_TAG],
        }
    }

    pub fn len(&self) -> usize {
        self.tt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tt.is_empty()
    }

    /// Translates a local id to its remote counterpart for this connection.
    ///
    /// Returns `(remote, true)` on success. On failure (the local id is not
    /// yet registered with this translator) returns `(tt[0], false)` — the
    /// caller must treat this as a failure and trigger re-negotiation; the
    /// fallback id ensures an entry is never forwarded with an uninitialized
    /// remote tag.
    pub fn translate(&self, local: LocalTagId) -> (RemoteTagId, bool) {
        if local == GRAVWELL_TAG {
            return (GRAVWELL_REMOTE_TAG, true);
        }
        match self.tt.get(local.0 as usize) {
            Some(remote) => (*remote, true),
            None => (self.tt[0], false),
        }
    }

    /// Appends a new mapping. Must be called with `local` exactly equal to
    /// the current length (strict append-at-end); otherwise the translator
    /// is out of sync with the tag table and the connection must be dropped.
    pub fn register_tag(&mut self, local: LocalTagId, remote: RemoteTagId) -> Result<()> {
        if local.0 as usize != self.tt.len() {
            bail!(
                "tag translator out of sync: expected next id {}, got {}",
                self.tt.len(),
                local.0
            );
        }
        self.tt.push(remote);
        Ok(())
    }

    /// Reverses a remote id back to its local counterpart. Used only on the
    /// slow path (recycling entries from a dying connection); returns
    /// `LocalTagId(0)` if not found, matching the source behavior (see
    /// DESIGN.md open question on this fallback).
    pub fn reverse(&self, remote: RemoteTagId) -> LocalTagId {
        if remote == GRAVWELL_REMOTE_TAG {
            return GRAVWELL_TAG;
        }
        self.tt
            .iter()
            .position(|r| *r == remote)
            .map(|i| LocalTagId(i as u32))
            .unwrap_or(GRAVWELL_TAG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_seeds_gravwell_at_zero() {
        let t = TagTable::new(std::iter::empty()).unwrap();
        assert_eq!(t.get(GRAVWELL_TAG_NAME), Some(GRAVWELL_TAG));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn negotiate_is_idempotent() {
        let mut t = TagTable::new(std::iter::empty()).unwrap();
        let (id1, created1) = t.negotiate("default").unwrap();
        let (id2, created2) = t.negotiate("default").unwrap();
        assert_eq!(id1, id2);
        assert!(created1);
        assert!(!created2);
    }

    #[test]
    fn translator_round_trips() {
        let mut tt = TagTranslator::new();
        let local = LocalTagId(1);
        tt.register_tag(local, RemoteTagId(42)).unwrap();
        let (remote, ok) = tt.translate(local);
        assert!(ok);
        assert_eq!(remote, RemoteTagId(42));
        assert_eq!(tt.reverse(remote), local);
    }

    #[test]
    fn translator_rejects_out_of_order_register() {
        let mut tt = TagTranslator::new();
        assert!(tt.register_tag(LocalTagId(5), RemoteTagId(1)).is_err());
    }

    #[test]
    fn translator_unknown_local_fails_with_fallback() {
        let tt = TagTranslator::new();
        let (remote, ok) = tt.translate(LocalTagId(3));
        assert!(!ok);
        assert_eq!(remote, tt.tt[0]);
    }

    #[test]
    fn gravwell_tag_passes_through() {
        let tt = TagTranslator::new();
        let (remote, ok) = tt.translate(GRAVWELL_TAG);
        assert!(ok);
        assert_eq!(remote, GRAVWELL_REMOTE_TAG);
        assert_eq!(tt.reverse(GRAVWELL_REMOTE_TAG), GRAVWELL_TAG);
    }

    #[test]
    fn check_tag_rejects_bad_chars() {
        assert!(check_tag("ok-tag_1.2").is_ok());
        assert!(check_tag("").is_err());
        assert!(check_tag("bad tag").is_err());
        assert!(check_tag("bad/tag").is_err());
    }
}
