//! Timeline diff: compare two published item lists so the watcher only
//! reports what actually changed.
//!
//! Items are matched by id. Identical texts share an id, so repeated ids are
//! matched by occurrence (the second "u-921" in the old list pairs with the
//! second in the new list).

use std::collections::HashMap;

use crate::dom::MessageItem;

/// Maximum number of diff entries to return.
const MAX_DIFF_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    Added(MessageItem),
    Removed(MessageItem),
    /// Same message, different summary (the message was edited or is still
    /// streaming in).
    Retitled { id: String, old: String, new: String },
}

pub struct DiffResult {
    pub entries: Vec<DiffEntry>,
    pub total_changes: usize,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.total_changes == 0
    }
}

/// Key every item by `(id, nth occurrence of that id)`.
fn keyed(items: &[MessageItem]) -> Vec<((&str, usize), &MessageItem)> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    items
        .iter()
        .map(|item| {
            let n = seen.entry(item.id.as_str()).or_insert(0);
            let key = (item.id.as_str(), *n);
            *n += 1;
            (key, item)
        })
        .collect()
}

/// Changes from `old` to `new`, in new-list order, removals last.
pub fn diff_items(old: &[MessageItem], new: &[MessageItem]) -> DiffResult {
    let old_keyed = keyed(old);
    let new_keyed = keyed(new);
    let old_map: HashMap<_, _> = old_keyed.iter().copied().collect();
    let new_map: HashMap<_, _> = new_keyed.iter().copied().collect();

    let mut entries = Vec::new();
    for (key, item) in &new_keyed {
        match old_map.get(key) {
            Some(previous) if previous.text != item.text => entries.push(DiffEntry::Retitled {
                id: item.id.clone(),
                old: previous.text.clone(),
                new: item.text.clone(),
            }),
            Some(_) => {}
            None => entries.push(DiffEntry::Added((*item).clone())),
        }
    }
    for (key, item) in &old_keyed {
        if !new_map.contains_key(key) {
            entries.push(DiffEntry::Removed((*item).clone()));
        }
    }

    let total = entries.len();
    entries.truncate(MAX_DIFF_ENTRIES);
    DiffResult {
        entries,
        total_changes: total,
    }
}

/// Format a diff result into compact text output.
pub fn format_diff(diff: &DiffResult) -> String {
    if diff.entries.is_empty() {
        return "no changes".into();
    }

    let mut output = format!("diff: {} changes\n", diff.total_changes);
    for entry in &diff.entries {
        match entry {
            DiffEntry::Added(item) => {
                output.push_str(&format!("+ {} \"{}\"\n", item.id, item.text));
            }
            DiffEntry::Removed(item) => {
                output.push_str(&format!("- {} \"{}\"\n", item.id, item.text));
            }
            DiffEntry::Retitled { id, old, new } => {
                output.push_str(&format!("~ {id} \"{old}\" -> \"{new}\"\n"));
            }
        }
    }

    if diff.total_changes > MAX_DIFF_ENTRIES {
        output.push_str(&format!(
            "...and {} more changes\n",
            diff.total_changes - MAX_DIFF_ENTRIES
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, text: &str) -> MessageItem {
        MessageItem {
            id: id.into(),
            text: text.into(),
        }
    }

    #[test]
    fn identical_lists_have_no_changes() {
        let items = vec![item("u-1", "a"), item("u-2", "b")];
        let diff = diff_items(&items, &items);
        assert!(diff.is_empty());
        assert_eq!(format_diff(&diff), "no changes");
    }

    #[test]
    fn added_removed_and_retitled() {
        let old = vec![item("u-1", "a"), item("u-2", "b")];
        let new = vec![item("u-1", "a edited"), item("u-3", "c")];
        let diff = diff_items(&old, &new);
        assert_eq!(
            diff.entries,
            vec![
                DiffEntry::Retitled {
                    id: "u-1".into(),
                    old: "a".into(),
                    new: "a edited".into()
                },
                DiffEntry::Added(item("u-3", "c")),
                DiffEntry::Removed(item("u-2", "b")),
            ]
        );
        let text = format_diff(&diff);
        assert!(text.starts_with("diff: 3 changes\n"));
        assert!(text.contains("~ u-1 \"a\" -> \"a edited\""));
        assert!(text.contains("+ u-3 \"c\""));
        assert!(text.contains("- u-2 \"b\""));
    }

    #[test]
    fn duplicate_ids_match_by_occurrence() {
        let old = vec![item("u-921", "Hi"), item("u-921", "Hi")];
        let new = vec![item("u-921", "Hi"), item("u-921", "Hi"), item("u-921", "Hi")];
        let diff = diff_items(&old, &new);
        assert_eq!(diff.entries, vec![DiffEntry::Added(item("u-921", "Hi"))]);
    }

    #[test]
    fn entries_are_capped() {
        let new: Vec<_> = (0..60).map(|i| item(&format!("u-{i}"), "x")).collect();
        let diff = diff_items(&[], &new);
        assert_eq!(diff.total_changes, 60);
        assert_eq!(diff.entries.len(), MAX_DIFF_ENTRIES);
        assert!(format_diff(&diff).ends_with("...and 10 more changes\n"));
    }
}
