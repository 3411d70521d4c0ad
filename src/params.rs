//! Parameter bags: the value type carried by every call and return.
//!
//! A bag is an ordered collection of (key, value) byte-string pairs with
//! first-write-wins mapping semantics. Keys and values are arbitrary bytes;
//! the escape codec makes them safe for the text framing, so a bag can
//! carry binary payloads as readily as UTF-8 text.

/// Ordered first-write-wins mapping of byte-string keys to byte-string values
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ParamBag {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl ParamBag {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair. Returns false (and changes nothing) when the key is
    /// already present: the first write wins.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> bool {
        let key = key.into();
        if self.contains_key(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    /// Insert a pair whose value may be absent. Absent values are filtered
    /// on the send side, so a `None` here never reaches the wire.
    pub fn insert_opt(&mut self, key: impl Into<Vec<u8>>, value: Option<impl Into<Vec<u8>>>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    /// Look up a value by key
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        let key = key.as_ref();
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Look up a value and decode it as UTF-8
    pub fn get_str(&self, key: impl AsRef<[u8]>) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// True when the key is present
    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Number of pairs in the bag
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the bag holds no pairs
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all pairs
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

impl<K: Into<Vec<u8>>, V: Into<Vec<u8>>> FromIterator<(K, V)> for ParamBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = ParamBag::new();
        for (k, v) in iter {
            bag.insert(k, v);
        }
        bag
    }
}

impl std::fmt::Debug for ParamBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lossy = |b: &[u8]| String::from_utf8_lossy(b).into_owned();
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (lossy(k), lossy(v))))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_wins() {
        let mut bag = ParamBag::new();
        assert!(bag.insert("key", "first"));
        assert!(!bag.insert("key", "second"));
        assert_eq!(bag.get("key"), Some(&b"first"[..]));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn test_insert_opt_filters_absent_values() {
        let mut bag = ParamBag::new();
        bag.insert_opt("present", Some("value"));
        bag.insert_opt("absent", None::<&str>);
        assert_eq!(bag.len(), 1);
        assert!(!bag.contains_key("absent"));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let bag: ParamBag = [("b", "2"), ("a", "1"), ("c", "3")].into_iter().collect();
        let keys: Vec<&[u8]> = bag.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"b"[..], &b"a"[..], &b"c"[..]]);
    }

    #[test]
    fn test_binary_keys_and_values() {
        let mut bag = ParamBag::new();
        bag.insert(vec![0u8, 7, 9, 10], vec![255u8, 0]);
        assert_eq!(bag.get([0u8, 7, 9, 10]), Some(&[255u8, 0][..]));
        assert_eq!(bag.get_str([0u8, 7, 9, 10]), None);
    }

    #[test]
    fn test_get_str_decodes_utf8() {
        let bag: ParamBag = [("greeting", "grüß")].into_iter().collect();
        assert_eq!(bag.get_str("greeting"), Some("grüß"));
    }
}
