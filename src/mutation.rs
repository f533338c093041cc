//! DOM mutation observation.
//!
//! Two halves live here:
//! 1. The in-process subscription abstraction used by [`crate::dom::Page`]:
//!    handlers register interest in a subtree and receive batches of
//!    [`MutationRecord`]s, in the spirit of the platform `MutationObserver`.
//! 2. The page-side observer injected over CDP in live-browser mode, which only
//!    flips a dirty flag so the watcher knows when to re-snapshot.

use ego_tree::NodeId;

/// What kind of change a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    Attributes,
    CharacterData,
}

/// One change to the document.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    /// Parent for child-list changes, the element for attribute changes, the
    /// text node for character-data changes.
    pub target: NodeId,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    /// Attribute name for `Attributes` records.
    pub attribute: Option<String>,
}

impl MutationRecord {
    pub fn child_list(target: NodeId, added: Vec<NodeId>, removed: Vec<NodeId>) -> Self {
        Self {
            kind: MutationKind::ChildList,
            target,
            added,
            removed,
            attribute: None,
        }
    }

    pub fn attribute(target: NodeId, name: &str) -> Self {
        Self {
            kind: MutationKind::Attributes,
            target,
            added: vec![],
            removed: vec![],
            attribute: Some(name.to_string()),
        }
    }

    pub fn character_data(target: NodeId) -> Self {
        Self {
            kind: MutationKind::CharacterData,
            target,
            added: vec![],
            removed: vec![],
            attribute: None,
        }
    }
}

/// Which records an observer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserveOptions {
    pub child_list: bool,
    pub attributes: bool,
    pub character_data: bool,
    pub subtree: bool,
}

impl ObserveOptions {
    /// Coarse document watcher: child additions/removals anywhere below the target.
    pub fn subtree_children() -> Self {
        Self {
            child_list: true,
            subtree: true,
            ..Self::default()
        }
    }

    /// Panel-scoped watcher: structure and attribute changes below a panel root.
    pub fn panel() -> Self {
        Self {
            child_list: true,
            attributes: true,
            subtree: true,
            ..Self::default()
        }
    }

    fn wants(&self, kind: MutationKind) -> bool {
        match kind {
            MutationKind::ChildList => self.child_list,
            MutationKind::Attributes => self.attributes,
            MutationKind::CharacterData => self.character_data,
        }
    }
}

/// Handle returned by [`crate::dom::Page::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

#[derive(Debug)]
struct Registration {
    id: ObserverId,
    target: NodeId,
    options: ObserveOptions,
    queue: Vec<MutationRecord>,
}

/// Registered observers and their undelivered records.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    next_id: u64,
    registrations: Vec<Registration>,
}

impl ObserverRegistry {
    pub fn observe(&mut self, target: NodeId, options: ObserveOptions) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.registrations.push(Registration {
            id,
            target,
            options,
            queue: Vec::new(),
        });
        id
    }

    /// Stop delivery and drop anything still queued. Returns false for unknown ids.
    pub fn disconnect(&mut self, id: ObserverId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        self.registrations.len() != before
    }

    pub fn is_active(&self, id: ObserverId) -> bool {
        self.registrations.iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Queue `record` for every interested observer. Interest is decided now,
    /// against the ancestry the target has at mutation time.
    pub fn queue<F>(&mut self, record: MutationRecord, is_inclusive_descendant: F)
    where
        F: Fn(NodeId, NodeId) -> bool,
    {
        for reg in &mut self.registrations {
            if !reg.options.wants(record.kind) {
                continue;
            }
            let in_scope = record.target == reg.target
                || (reg.options.subtree && is_inclusive_descendant(reg.target, record.target));
            if in_scope {
                reg.queue.push(record.clone());
            }
        }
    }

    /// Drain pending batches in registration order, skipping empty queues.
    pub fn take_records(&mut self) -> Vec<(ObserverId, Vec<MutationRecord>)> {
        self.registrations
            .iter_mut()
            .filter(|r| !r.queue.is_empty())
            .map(|r| (r.id, std::mem::take(&mut r.queue)))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.registrations.iter().any(|r| !r.queue.is_empty())
    }
}

// ── Live-browser observer (injected over CDP) ──────────────────────────────

/// Installs a body-wide MutationObserver that only marks the page dirty, plus a
/// capturing keydown listener that records Enter-without-Shift inside editable
/// inputs as a send intent. Safe to call repeatedly.
pub const INSTALL_OBSERVER_JS: &str = r#"(function() {
    if (window.__chat_lens_observer) {
        window.__chat_lens_observer.disconnect();
    }
    window.__chat_lens_dirty = true;
    window.__chat_lens_mutation_count = 0;
    window.__chat_lens_send_intent = false;
    window.__chat_lens_observer = new MutationObserver(function(mutations) {
        window.__chat_lens_dirty = true;
        window.__chat_lens_mutation_count += mutations.length;
    });
    var target = document.body || document.documentElement;
    if (target) {
        window.__chat_lens_observer.observe(target, {
            childList: true,
            characterData: true,
            subtree: true
        });
    }
    if (!window.__chat_lens_keys) {
        window.__chat_lens_keys = true;
        document.addEventListener('keydown', function(e) {
            var t = e.target;
            if (e.key === 'Enter' && !e.shiftKey && t &&
                (t.getAttribute && t.getAttribute('contenteditable') === 'true' ||
                 (t.classList && t.classList.contains('ql-editor')))) {
                window.__chat_lens_send_intent = true;
                window.__chat_lens_dirty = true;
            }
        }, true);
    }
    return 'installed';
})()"#;

/// Returns JSON: {"dirty": bool, "count": number, "sendIntent": bool}
pub const CHECK_DIRTY_JS: &str = r#"(function() {
    return JSON.stringify({
        dirty: !!window.__chat_lens_dirty,
        count: window.__chat_lens_mutation_count || 0,
        sendIntent: !!window.__chat_lens_send_intent
    });
})()"#;

/// Clears the dirty flag and send intent after a snapshot. Returns the mutation count.
pub const RESET_DIRTY_JS: &str = r#"(function() {
    var count = window.__chat_lens_mutation_count || 0;
    window.__chat_lens_dirty = false;
    window.__chat_lens_mutation_count = 0;
    window.__chat_lens_send_intent = false;
    return count;
})()"#;

/// Parsed result of CHECK_DIRTY_JS.
#[derive(Debug)]
pub struct DirtyState {
    pub dirty: bool,
    pub mutation_count: u64,
    pub send_intent: bool,
}

impl DirtyState {
    pub fn from_json(json: &str) -> Self {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            dirty: bool,
            count: u64,
            #[serde(default)]
            send_intent: bool,
        }

        match serde_json::from_str::<Raw>(json) {
            Ok(raw) => DirtyState {
                dirty: raw.dirty,
                mutation_count: raw.count,
                send_intent: raw.send_intent,
            },
            Err(_) => DirtyState {
                dirty: true, // assume dirty on parse failure (e.g. page navigated)
                mutation_count: 0,
                send_intent: false,
            },
        }
    }
}
