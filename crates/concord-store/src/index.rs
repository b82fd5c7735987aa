use std::collections::{BTreeMap, BTreeSet};

use concord_base::{Descriptor, Key};

/// A registered index name.
pub type IndexName = String;

/// A single per-node index: `extractor descriptor` plus the
/// `term -> keys` table it maintains.
///
/// Indexes are *not* replicated state — they are rebuilt locally from
/// `Store` contents on startup, on explicit `reindex`, and whenever a
/// fresh node drops behind and catches up via snapshot install.
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    extractor: Descriptor,
    terms: BTreeMap<Vec<u8>, BTreeSet<Key>>,
    by_key: BTreeMap<Key, Vec<Vec<u8>>>,
}

impl SecondaryIndex {
    pub fn new(extractor: Descriptor) -> Self {
        SecondaryIndex {
            extractor,
            terms: BTreeMap::new(),
            by_key: BTreeMap::new(),
        }
    }

    pub fn extractor(&self) -> &Descriptor {
        &self.extractor
    }

    /// Re-derive this key's index terms from `value` and update the
    /// term tables. Extractor failures (an unparseable value) are
    /// swallowed — the key is simply removed from the index.
    pub fn update(&mut self, key: &Key, value: &[u8]) {
        self.remove(key);
        let terms = self.extractor.extract(&value.to_vec());
        if terms.is_empty() {
            return;
        }
        for term in &terms {
            self.terms.entry(term.clone()).or_default().insert(key.clone());
        }
        self.by_key.insert(key.clone(), terms);
    }

    /// Remove `key` from the index entirely (on delete, or before
    /// `update` recomputes its terms).
    pub fn remove(&mut self, key: &Key) {
        if let Some(old_terms) = self.by_key.remove(key) {
            for term in old_terms {
                if let Some(keys) = self.terms.get_mut(&term) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.terms.remove(&term);
                    }
                }
            }
        }
    }

    /// Look up the keys whose extracted terms include `term`'s encoding.
    pub fn lookup(&self, term: &[u8]) -> Option<Vec<Key>> {
        self.terms.get(term).map(|keys| keys.iter().cloned().collect())
    }

    pub fn clear(&mut self) {
        self.terms.clear();
        self.by_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_base::FieldPath;

    fn key(s: &str) -> Key {
        Key::new(s.as_bytes().to_vec()).unwrap()
    }

    fn msgpack(v: impl serde::Serialize) -> Vec<u8> {
        rmp_serde::to_vec(&v).unwrap()
    }

    #[test]
    fn update_then_lookup_then_remove() {
        let mut idx = SecondaryIndex::new(Descriptor::Field(FieldPath::Root));
        idx.update(&key("a"), &msgpack("blue"));
        idx.update(&key("b"), &msgpack("blue"));
        idx.update(&key("c"), &msgpack("red"));

        let blues = idx.lookup(&msgpack("blue")).unwrap();
        assert_eq!(blues.len(), 2);

        idx.remove(&key("a"));
        let blues = idx.lookup(&msgpack("blue")).unwrap();
        assert_eq!(blues, vec![key("b")]);
    }

    #[test]
    fn reinserting_key_replaces_old_terms() {
        let mut idx = SecondaryIndex::new(Descriptor::Field(FieldPath::Root));
        idx.update(&key("a"), &msgpack("blue"));
        idx.update(&key("a"), &msgpack("red"));
        assert!(idx.lookup(&msgpack("blue")).is_none());
        assert_eq!(idx.lookup(&msgpack("red")).unwrap(), vec![key("a")]);
    }
}
