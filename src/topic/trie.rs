//! Topic trie for subscription matching
//!
//! A prefix tree keyed by filter level with dedicated `+` and `#` children.
//! It is an index over filters: for any topic, `matches` visits exactly the
//! filters for which `topic_matches_filter` returns true.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending at this node
    value: Option<V>,
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a filter ending in `#` below this node
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic trie indexed by subscription filter
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Slot holding the value for `filter`, creating the path if needed
    fn slot_mut(&mut self, filter: &str) -> &mut Option<V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return &mut node.multi_wildcard;
            }

            node = if level == "+" {
                node.single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                break;
            }
        }

        &mut node.value
    }

    /// Get the value at `filter`, inserting one built by `init` if absent
    pub fn get_or_insert_with<F>(&mut self, filter: &str, init: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        self.slot_mut(filter).get_or_insert_with(init)
    }

    /// Insert a filter with its value, replacing any previous value
    pub fn insert(&mut self, filter: &str, value: V) {
        *self.slot_mut(filter) = Some(value);
    }

    /// Get a mutable reference to the value at a filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.as_mut();
            } else if level == "+" {
                node = node.single_wildcard.as_mut()?;
            } else {
                node = node.children.get_mut(level)?;
            }

            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove a filter from the trie, pruning empty branches
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        if level == "#" {
            return node.multi_wildcard.take();
        }

        if level == "+" {
            let child = node.single_wildcard.as_mut()?;
            let removed = Self::remove_recursive(child, rest);
            if child.is_empty() {
                node.single_wildcard = None;
            }
            removed
        } else {
            let child = node.children.get_mut(level)?;
            let removed = Self::remove_recursive(child, rest);
            if child.is_empty() {
                node.children.remove(level);
            }
            removed
        }
    }

    /// Visit every value whose filter matches `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        // $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        let wildcards_allowed = !(is_system_topic && index == 0);

        // `#` matches the remaining levels, including none
        if wildcards_allowed {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        if index >= levels.len() {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        }

        if wildcards_allowed {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut callback);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(ref v) = node.value {
            callback(v);
        }
        if let Some(ref v) = node.multi_wildcard {
            callback(v);
        }
        if let Some(ref child) = node.single_wildcard {
            Self::for_each_recursive(child, callback);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::topic_matches_filter;
    use proptest::prelude::*;

    fn collect(trie: &TopicTrie<u32>, topic: &str) -> Vec<u32> {
        let mut matches = Vec::new();
        trie.matches(topic, |v| matches.push(*v));
        matches.sort();
        matches
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        trie.insert("test/topic", 1);

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("test/+", 1);
        trie.insert("+/topic", 2);
        trie.insert("+/+", 3);

        assert_eq!(collect(&trie, "test/topic"), vec![1, 2, 3]);
    }

    #[test]
    fn test_multi_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("test/#", 2);

        assert_eq!(collect(&trie, "test/topic/deep"), vec![1, 2]);
        assert_eq!(collect(&trie, "test"), vec![1, 2]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("+/test", 2);
        trie.insert("$SYS/#", 3);

        assert_eq!(collect(&trie, "$SYS/test"), vec![3]);
    }

    #[test]
    fn test_insert_replaces() {
        let mut trie = TopicTrie::new();
        trie.insert("a/b", 1);
        trie.insert("a/b", 2);
        assert_eq!(collect(&trie, "a/b"), vec![2]);
    }

    #[test]
    fn test_remove_prunes() {
        let mut trie = TopicTrie::new();
        trie.insert("test/+/deep", 1);
        trie.insert("test/#", 2);

        assert_eq!(trie.remove("test/+/deep"), Some(1));
        assert_eq!(trie.remove("test/+/deep"), None);
        assert_eq!(trie.remove("test/#"), Some(2));
        assert!(trie.root.is_empty());
    }

    fn level() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("a".to_string()),
            Just("b".to_string()),
            Just(String::new()),
            Just("$x".to_string()),
        ]
    }

    fn filter_level() -> impl Strategy<Value = String> {
        prop_oneof![level(), Just("+".to_string())]
    }

    fn topic() -> impl Strategy<Value = String> {
        prop::collection::vec(level(), 1..5).prop_map(|l| l.join("/"))
    }

    fn filter() -> impl Strategy<Value = String> {
        (prop::collection::vec(filter_level(), 1..5), any::<bool>()).prop_map(|(mut l, hash)| {
            if hash {
                l.push("#".to_string());
            }
            l.join("/")
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_trie_agrees_with_linear_scan(
            filters in prop::collection::vec(filter(), 1..12),
            topic in topic(),
        ) {
            let mut trie = TopicTrie::new();
            for (i, f) in filters.iter().enumerate() {
                trie.insert(f, i as u32);
            }

            // Later duplicates replace earlier ones in the trie
            let mut expected: Vec<u32> = Vec::new();
            for (i, f) in filters.iter().enumerate() {
                let last = filters.iter().rposition(|g| g == f) == Some(i);
                if last && topic_matches_filter(&topic, f) {
                    expected.push(i as u32);
                }
            }
            expected.sort();

            prop_assert_eq!(collect(&trie, &topic), expected);
        }
    }
}
