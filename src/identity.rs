//! Stable identities for message elements.
//!
//! Precedence: a previously cached id for the element, then a sufficiently
//! long native `id` on the element or its nearest ancestor carrying one, then
//! `u-` + hash of the normalized text. Identical texts share an id; that
//! collision is accepted.

use std::collections::HashMap;

use ego_tree::NodeId;
use tracing::trace;

use crate::dom::Page;
use crate::text::hash_string;

/// Prefix for content-derived ids.
pub const HASH_ID_PREFIX: &str = "u-";

/// Side table of assigned ids, keyed by element identity. Once an element has
/// an id it keeps it for as long as the node lives, whatever its text becomes.
#[derive(Debug, Default)]
pub struct IdentityCache {
    ids: HashMap<NodeId, String>,
}

impl IdentityCache {
    pub fn get(&self, element: NodeId) -> Option<&str> {
        self.ids.get(&element).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Drop entries for elements no longer in the document.
    pub fn prune(&mut self, page: &Page) {
        self.ids.retain(|id, _| page.is_attached(*id));
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

pub fn assign_id(
    page: &mut Page,
    cache: &mut IdentityCache,
    element: NodeId,
    index: usize,
    normalized_text: &str,
    native_id_min_len: usize,
) -> String {
    if let Some(id) = cache.get(element) {
        return id.to_string();
    }

    let native = page
        .closest_with_attr(element, "id")
        .and_then(|owner| page.attr(owner, "id"))
        .filter(|id| id.chars().count() > native_id_min_len)
        .map(str::to_string);

    let id = match native {
        Some(id) => id,
        None => format!("{HASH_ID_PREFIX}{}", hash_string(normalized_text)),
    };
    trace!(index = index, id = %id, "assigned message id");

    cache.ids.insert(element, id.clone());
    // Scroll-to-message looks elements up by id.
    if page.attr(element, "id").is_none() {
        page.set_attr(element, "id", &id);
    }
    id
}
