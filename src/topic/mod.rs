//! Topic matching
//!
//! Topic name/filter validation, the pure matching function and a topic trie
//! used as a subscription index.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

/// Does `filter` match the concrete `topic`
///
/// Pure and lock-free, safe to call from any dispatch path.
#[inline]
pub fn matches(filter: &str, topic: &str) -> bool {
    topic_matches_filter(topic, filter)
}
