//! MQTT-style topic names and filters.
//!
//! Topics are `/`-separated levels.  A filter may use `+` to match exactly
//! one level and a trailing `#` to match every remaining level (including
//! none, so `"cube/#"` matches `"cube"`).

/// `true` if `topic` is a publishable topic name: non-empty and free of
/// wildcard characters.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// `true` if `filter` is a well-formed subscription filter.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}

/// Match a concrete `topic` against a subscription `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Split a device telemetry topic `"<address>/<event>"` into its two
/// segments.  Anything that is not exactly two non-empty levels is `None`.
pub fn split_device_topic(topic: &str) -> Option<(&str, &str)> {
    let (address, event) = topic.split_once('/')?;
    if address.is_empty() || event.is_empty() || event.contains('/') {
        return None;
    }
    Some((address, event))
}
