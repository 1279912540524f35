//! Hierarchical path model (spec §3.1, §4.1).
//!
//! A path is a value-typed, immutable sequence of non-empty segments.
//! The canonical string form is `/a/b/c`; the empty sequence is root
//! (`/`). Segments are escaped on the wire so that `/`, `\`, and the
//! escape character itself can appear inside a segment.

use std::fmt;

use serde::{Deserialize, Serialize};

const SEP: char = '/';
const ESC: char = '-';
const ESC_SEP: char = 'X';
const ESC_ESC_CHAR: char = 'Y';
const ESC_ESC: char = '-';

/// A well-formed, structurally-comparable hierarchical path.
///
/// `Path` is cheap to clone (it owns a `Vec<String>` of unescaped
/// segments) and carries no borrowed state, matching the value-typed
/// record style the rest of this crate uses for entries and sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path {
    segments: Vec<String>,
}

/// A segment or escape sequence could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PathError(pub String);

impl Path {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Builds a path directly from already-unescaped segments.
    /// Whitespace-only segments are dropped, mirroring `parse`.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(Into::into)
                .filter(|s| !s.trim().is_empty())
                .collect(),
        }
    }

    /// Parses a canonical escaped path string. Fails with `PathError`
    /// only when an escape sequence inside a segment is malformed (a
    /// `-` not followed by `X`, `Y`, or `-`).
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let mut segments = Vec::new();
        for raw in text.split(SEP) {
            if raw.trim().is_empty() {
                continue;
            }
            segments.push(unescape_segment(raw)?);
        }
        Ok(Self { segments })
    }

    /// Total variant of [`Path::parse`]: malformed input falls back to
    /// root instead of failing, for callers that need a value rather
    /// than a result (spec's "`from_escaped(text) → Path | default`").
    pub fn parse_lossy(text: &str) -> Self {
        Self::parse(text).unwrap_or_else(|_| Self::root())
    }

    /// Canonical escaped string form, e.g. `/a/b/c`. Root escapes to `/`.
    pub fn to_escaped(&self) -> String {
        if self.is_root() {
            return SEP.to_string();
        }
        let mut out = String::new();
        for seg in &self.segments {
            out.push(SEP);
            out.push_str(&escape_segment(seg));
        }
        out
    }

    /// The parent path, or `None` if this is already root.
    pub fn parent(&self) -> Option<Path> {
        if self.is_root() {
            return None;
        }
        Some(Path {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Root through (and including) the parent, in root-to-parent
    /// order. Empty for root itself (root has no proper ancestors).
    pub fn ancestors(&self) -> Vec<Path> {
        if self.is_root() {
            return Vec::new();
        }
        let mut out = vec![Path::root()];
        let mut cur = Path::root();
        for seg in &self.segments[..self.segments.len() - 1] {
            cur = cur.child(seg);
            out.push(cur.clone());
        }
        out
    }

    /// The last segment (the entry's own name within its parent), or
    /// `None` for root.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Appends one segment, returning a new path (paths are immutable;
    /// this never mutates `self`).
    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path { segments }
    }

    /// Appends a sequence of segments.
    pub fn child_path<I, S>(&self, segments: I) -> Path
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = self.segments.clone();
        out.extend(segments.into_iter().map(Into::into));
        Path { segments: out }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_escaped())
    }
}

fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for ch in segment.chars() {
        match ch {
            SEP => {
                out.push(ESC);
                out.push(ESC_SEP);
            }
            '\\' => {
                out.push(ESC);
                out.push(ESC_ESC_CHAR);
            }
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            }
            other => out.push(other),
        }
    }
    out
}

fn unescape_segment(raw: &str) -> Result<String, PathError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != ESC {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some(ESC_SEP) => out.push(SEP),
            Some(ESC_ESC_CHAR) => out.push('\\'),
            Some(ESC_ESC) => out.push(ESC),
            other => {
                return Err(PathError(format!(
                    "malformed escape sequence in segment {raw:?}: '-' followed by {other:?}"
                )));
            }
        }
    }
    let trimmed = out.trim();
    if trimmed.is_empty() {
        return Err(PathError(format!("segment {raw:?} escapes to empty string")));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_roundtrips() {
        assert_eq!(Path::parse("/").unwrap(), Path::root());
        assert_eq!(Path::root().to_escaped(), "/");
    }

    #[test]
    fn delimiter_only_path_is_root() {
        assert_eq!(Path::parse("///").unwrap(), Path::root());
    }

    #[test]
    fn roundtrip_l1() {
        let p = Path::from_segments(["a", "b", "c"]);
        let escaped = p.to_escaped();
        assert_eq!(escaped, "/a/b/c");
        assert_eq!(Path::parse(&escaped).unwrap(), p);
    }

    #[test]
    fn escapes_special_characters() {
        let p = Path::from_segments(["a/b", "c-d", "e\\f"]);
        let escaped = p.to_escaped();
        let back = Path::parse(&escaped).unwrap();
        assert_eq!(back, p);
        assert!(escaped.contains("-X"));
        assert!(escaped.contains("--"));
        assert!(escaped.contains("-Y"));
    }

    #[test]
    fn malformed_escape_fails() {
        let err = Path::parse("/a-Zb").unwrap_err();
        assert!(err.0.contains("malformed escape"));
        assert_eq!(Path::parse_lossy("/a-Zb"), Path::root());
    }

    #[test]
    fn whitespace_only_segments_are_stripped() {
        let p = Path::parse("/a/   /b").unwrap();
        assert_eq!(p, Path::from_segments(["a", "b"]));
    }

    #[test]
    fn parent_and_ancestors() {
        let p = Path::from_segments(["a", "b", "c"]);
        assert_eq!(p.parent().unwrap(), Path::from_segments(["a", "b"]));
        assert_eq!(Path::root().parent(), None);

        let ancestors = p.ancestors();
        assert_eq!(
            ancestors,
            vec![Path::root(), Path::from_segments(["a"]), Path::from_segments(["a", "b"])]
        );
    }

    #[test]
    fn child_does_not_mutate_receiver() {
        let root = Path::root();
        let child = root.child("x");
        assert!(root.is_root());
        assert_eq!(child, Path::from_segments(["x"]));
    }

    #[test]
    fn child_path_appends_multiple_segments() {
        let p = Path::root().child_path(["a", "b"]);
        assert_eq!(p, Path::from_segments(["a", "b"]));
    }
}
