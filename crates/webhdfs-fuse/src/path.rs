//! Canonical absolute paths inside the remote namespace.

use std::fmt;

/// An absolute, slash-separated path with no trailing slash (except `/`),
/// no empty components and no `.`/`..` components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HdfsPath(String);

impl HdfsPath {
    pub fn root() -> Self {
        HdfsPath(String::from("/"))
    }

    /// Normalises `raw` into canonical form. `.` components are dropped and
    /// `..` pops the previous component; `..` above the root stays at the root.
    pub fn new(raw: &str) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for comp in raw.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                c => parts.push(c),
            }
        }
        if parts.is_empty() {
            return Self::root();
        }
        let mut s = String::with_capacity(raw.len() + 1);
        for p in parts {
            s.push('/');
            s.push_str(p);
        }
        HdfsPath(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Parent directory; the root is its own parent.
    pub fn parent(&self) -> HdfsPath {
        match self.0.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => HdfsPath(self.0[..idx].to_string()),
        }
    }

    /// Final component, empty for the root.
    pub fn file_name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Appends one component. `name` must not contain `/`.
    pub fn join(&self, name: &str) -> HdfsPath {
        if self.is_root() {
            HdfsPath(format!("/{}", name))
        } else {
            HdfsPath(format!("{}/{}", self.0, name))
        }
    }

    /// True when `self` is `ancestor` or lies anywhere below it.
    pub fn is_within(&self, ancestor: &HdfsPath) -> bool {
        if ancestor.is_root() || self == ancestor {
            return true;
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// Rewrites the `from` prefix of `self` to `to`. Returns `None` when
    /// `self` is not within `from`.
    pub fn rebase(&self, from: &HdfsPath, to: &HdfsPath) -> Option<HdfsPath> {
        if !self.is_within(from) {
            return None;
        }
        if self == from {
            return Some(to.clone());
        }
        let rest = if from.is_root() {
            &self.0[1..]
        } else {
            &self.0[from.0.len() + 1..]
        };
        Some(HdfsPath::new(&format!("{}/{}", to.0, rest)))
    }

    /// Path components without the leading root.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }
}

impl fmt::Display for HdfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HdfsPath {
    fn from(raw: &str) -> Self {
        HdfsPath::new(raw)
    }
}
