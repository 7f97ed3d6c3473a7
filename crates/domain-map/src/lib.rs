//! A lookup table keyed by domain name, with support for wildcard
//! entries like `*.example.com`.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

#[derive(Clone)]
struct Node<V> {
    value: Option<V>,
    children: HashMap<String, Self>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: HashMap::new(),
        }
    }
}

impl<V: Debug> Debug for Node<V> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Node")
            .field("value", &self.value)
            .field("children", &self.children)
            .finish()
    }
}

/// A DomainMap is conceptually similar to a HashMap whose keys are domain
/// name strings. A lookup first tries an exact match, then falls back to
/// the closest enclosing wildcard entry such as `*.example.com`.
/// The wildcard matches any label-bounded subdomain of its suffix, but not
/// the bare suffix itself: looking up "example.com" will never match
/// `*.example.com`. Wildcards do not cascade; the matching entry's value
/// is returned as-is.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, V>", into = "BTreeMap<String, V>")]
pub struct DomainMap<V: Clone> {
    root: Node<V>,
}

impl<V: Clone + Debug> Debug for DomainMap<V> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("DomainMap")
            .field("root", &self.root)
            .finish()
    }
}

impl<V: Clone> Default for DomainMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> DomainMap<V> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    /// Insert `value` under `pattern`, which is either a literal domain
    /// name or a `*.suffix` wildcard.
    pub fn insert(&mut self, pattern: &str, value: V) {
        let mut node = &mut self.root;
        for label in pattern.rsplit('.') {
            node = node
                .children
                .entry(label.to_ascii_lowercase())
                .or_default();
        }
        node.value.replace(value);
    }

    pub fn get(&self, domain: &str) -> Option<&V> {
        let mut node = &self.root;
        // The deepest wildcard seen while descending is the longest
        // suffix match, so it wins when the exact path runs out.
        let mut wildcard = None;
        for label in domain.rsplit('.') {
            if let Some(wild) = node.children.get("*") {
                wildcard = wild.value.as_ref();
            }
            match node.children.get(&label.to_ascii_lowercase()) {
                Some(child) => node = child,
                None => return wildcard,
            }
        }
        node.value.as_ref().or(wildcard)
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }
}

impl<V: Clone> From<BTreeMap<String, V>> for DomainMap<V> {
    fn from(map: BTreeMap<String, V>) -> Self {
        let mut result = Self::new();
        for (k, v) in map {
            result.insert(&k, v);
        }
        result
    }
}

fn walk<V: Clone>(node: &Node<V>, labels: &mut Vec<String>, result: &mut BTreeMap<String, V>) {
    if let Some(v) = &node.value {
        let mut name: Vec<String> = labels.clone();
        name.reverse();
        result.insert(name.join("."), v.clone());
    }
    for (label, child) in &node.children {
        labels.push(label.to_string());
        walk(child, labels, result);
        labels.pop();
    }
}

impl<V: Clone> From<DomainMap<V>> for BTreeMap<String, V> {
    fn from(map: DomainMap<V>) -> Self {
        let mut result = BTreeMap::new();
        walk(&map.root, &mut vec![], &mut result);
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_and_wildcard() {
        let mut map: DomainMap<char> = DomainMap::new();
        map.insert("example.com", 'A');
        map.insert("*.example.com", 'B');
        map.insert("www.example.com", 'C');

        assert_eq!(map.get("example.com"), Some(&'A'));
        assert_eq!(map.get("www.example.com"), Some(&'C'));
        assert_eq!(map.get("mail.example.com"), Some(&'B'));
        assert_eq!(map.get("deep.mail.example.com"), Some(&'B'));
        assert_eq!(map.get("elsewhere.com"), None);
    }

    #[test]
    fn longest_wildcard_wins() {
        let mut map: DomainMap<u32> = DomainMap::new();
        map.insert("*.com", 1);
        map.insert("*.example.com", 2);

        assert_eq!(map.get("foo.com"), Some(&1));
        assert_eq!(map.get("foo.example.com"), Some(&2));
        assert_eq!(map.get("a.b.example.com"), Some(&2));
        // the wildcard root itself is not matched by its own wildcard,
        // but the enclosing one still applies
        assert_eq!(map.get("example.com"), Some(&1));
        assert_eq!(map.get("com"), None);
    }

    #[test]
    fn intermediate_nodes_have_no_value() {
        let mut map: DomainMap<u32> = DomainMap::new();
        map.insert("omg.wtf.woot.example.com", 128);
        assert_eq!(map.get("woot.example.com"), None);
        assert_eq!(map.get("wtf.woot.example.com"), None);
        assert_eq!(map.get("omg.wtf.woot.example.com"), Some(&128));
    }

    #[test]
    fn case_insensitive() {
        let mut map: DomainMap<u32> = DomainMap::new();
        map.insert("Example.COM", 1);
        assert_eq!(map.get("example.com"), Some(&1));
        assert_eq!(map.get("EXAMPLE.com"), Some(&1));
    }

    #[test]
    fn serde_round_trip() {
        let mut map: DomainMap<u32> = DomainMap::new();
        map.insert("*.example.com", 42);
        map.insert("example.com", 24);

        let serialized: BTreeMap<String, u32> = map.into();
        k9::snapshot!(
            &serialized,
            r#"
{
    "*.example.com": 42,
    "example.com": 24,
}
"#
        );

        let round_trip: DomainMap<u32> = serialized.into();
        assert_eq!(round_trip.get("lemon.example.com"), Some(&42));
        assert_eq!(round_trip.get("example.com"), Some(&24));
    }
}
