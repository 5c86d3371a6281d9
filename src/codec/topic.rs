//! Topic names and topic filters
//!
//! Topic names are what PUBLISH packets carry; topic filters are what
//! SUBSCRIBE packets carry and may contain the `+` (one level) and `#`
//! (all remaining levels) wildcards. Topics starting with `$` are reserved
//! for the broker and are never matched by a filter that starts with a
//! wildcard.

const MAX_TOPIC_LEN: usize = 65_535;

/// A topic name is non-empty, has no wildcards and no NUL characters.
pub fn valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && !topic.contains(['+', '#', '\0'])
}

/// A topic filter is non-empty, `#` only appears alone as the last level and
/// `+` only appears alone in a level.
pub fn valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return false;
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        match level {
            "#" if !is_last => return false,
            "#" | "+" => {}
            other if other.contains(['+', '#']) => return false,
            _ => {}
        }
    }
    true
}

/// Whether `topic` is matched by `filter`. Both are assumed valid.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
