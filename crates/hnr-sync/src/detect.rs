use hnr_core::{Classification, StoryRecord};

/// Classifies a freshly fetched story against its last synced descendant count.
///
/// `previous` is `None` when the story has no membership row for the feed being
/// synced. Any difference in descendant count, up or down, counts as a change.
pub fn classify(previous: Option<i64>, fresh: &StoryRecord) -> Classification {
    match previous {
        None => Classification::New,
        Some(count) if count == fresh.descendant_count => Classification::Unchanged,
        Some(_) => Classification::Changed,
    }
}
