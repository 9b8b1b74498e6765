// SSH key collection
//
// Keys are deduplicated by their exact (trimmed) line; first insertion wins
// and fixes the position in the rendered list.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyProvenance {
    FetchedByAccount(String),
    Pasted,
    LoadedFromPath(PathBuf),
}

impl std::fmt::Display for KeyProvenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyProvenance::FetchedByAccount(account) => write!(f, "account {}", account),
            KeyProvenance::Pasted => write!(f, "pasted"),
            KeyProvenance::LoadedFromPath(path) => write!(f, "file {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyEntry {
    pub key: String,
    pub provenance: KeyProvenance,
    pub valid: bool,
}

impl SshKeyEntry {
    pub fn valid(key: impl Into<String>, provenance: KeyProvenance) -> Self {
        Self {
            key: key.into(),
            provenance,
            valid: true,
        }
    }

    /// Algorithm token plus the comment, if any (never the whole blob).
    pub fn summary(&self) -> String {
        let mut parts = self.key.split_whitespace();
        let key_type = parts.next().unwrap_or("?");
        let _body = parts.next();
        let comment: Vec<&str> = parts.collect();
        if comment.is_empty() {
            format!("{} ({})", key_type, self.provenance)
        } else {
            format!("{} {} ({})", key_type, comment.join(" "), self.provenance)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    entries: Vec<SshKeyEntry>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an entry with the same key string already exists.
    /// Returns whether the entry was added.
    pub fn insert(&mut self, entry: SshKeyEntry) -> bool {
        if self.entries.iter().any(|e| e.key == entry.key) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn extend<I: IntoIterator<Item = SshKeyEntry>>(&mut self, entries: I) -> usize {
        entries.into_iter().filter(|e| self.insert(e.clone())).count()
    }

    pub fn remove(&mut self, index: usize) -> Option<SshKeyEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SshKeyEntry> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
