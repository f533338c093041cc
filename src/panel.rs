//! Thoughts-panel readiness.
//!
//! Panels render in stages: the root appears first, then (in any order and
//! over any number of batches) its trigger control and its content region.
//! Each root moves through `Unwatched -> Watching -> Mounted`, or straight to
//! `Mounted` when everything is already there. A root is observed by at most
//! one panel-scoped subscription, dropped the moment the panel mounts or the
//! root leaves the document.

use std::collections::HashMap;

use anyhow::Result;
use ego_tree::NodeId;
use serde::Serialize;
use tracing::{debug, info};

use crate::augmenter::OverlaySink;
use crate::config::Selectors;
use crate::dom::Page;
use crate::mount::{Anchor, MountGuard, MountKind};
use crate::mutation::{MutationKind, MutationRecord, ObserveOptions, ObserverId};

/// Prefix for ids given to panel roots that have none.
pub const LOCATOR_PREFIX: &str = "chat-lens-thoughts-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelState {
    Unwatched,
    Watching(ObserverId),
    Mounted,
}

/// Re-finds a mounted panel by its root id, so widgets never hold on to node
/// references that a re-render may have replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelLocator {
    pub root_id: String,
}

impl PanelLocator {
    pub fn resolve_root(&self, page: &Page) -> Option<NodeId> {
        page.element_by_id(&self.root_id)
    }

    /// The panel's current content region, looked up from scratch.
    pub fn resolve_content(&self, page: &Page, selectors: &Selectors) -> Option<NodeId> {
        let root = self.resolve_root(page)?;
        let trigger = find_trigger(page, root, selectors)?;
        find_content(page, root, trigger, selectors)
    }
}

/// What the sink receives when a panel becomes ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelMount {
    pub trigger: NodeId,
    pub content: NodeId,
    pub root: NodeId,
    pub locator: PanelLocator,
}

pub fn find_trigger(page: &Page, root: NodeId, selectors: &Selectors) -> Option<NodeId> {
    selectors
        .panel_triggers
        .iter()
        .find_map(|c| page.query(root, &c.selector))
}

/// Content marker, then expansion body, then whatever follows the trigger.
pub fn find_content(
    page: &Page,
    root: NodeId,
    trigger: NodeId,
    selectors: &Selectors,
) -> Option<NodeId> {
    selectors
        .panel_content
        .iter()
        .find_map(|c| page.query(root, &c.selector))
        .or_else(|| page.next_element_sibling(trigger))
}

/// Per-root state table. Keys are non-owning node ids; `sweep_detached` drops
/// entries (and their subscriptions) once the root is gone.
#[derive(Debug, Default)]
pub struct PanelWatcher {
    states: HashMap<NodeId, PanelState>,
    next_locator: u64,
}

impl PanelWatcher {
    pub fn state(&self, root: NodeId) -> PanelState {
        self.states
            .get(&root)
            .copied()
            .unwrap_or(PanelState::Unwatched)
    }

    pub fn watching_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, PanelState::Watching(_)))
            .count()
    }

    pub fn mounted_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, PanelState::Mounted))
            .count()
    }

    /// The root a panel-scoped subscription belongs to.
    pub fn owner(&self, observer: ObserverId) -> Option<NodeId> {
        self.states
            .iter()
            .find(|(_, s)| **s == PanelState::Watching(observer))
            .map(|(root, _)| *root)
    }

    /// Drop all per-document state, disconnecting live subscriptions.
    pub fn clear(&mut self, page: &mut Page) {
        for state in self.states.values() {
            if let PanelState::Watching(observer) = state {
                page.disconnect(*observer);
            }
        }
        self.states.clear();
    }

    /// Initial scan: every panel root currently in the document. Returns how
    /// many panels mounted.
    pub fn scan<S>(
        &mut self,
        page: &mut Page,
        selectors: &Selectors,
        guard: &mut MountGuard,
        sink: &mut S,
    ) -> Result<usize>
    where
        S: OverlaySink + ?Sized,
    {
        let roots: Vec<NodeId> = selectors
            .panel_root
            .iter()
            .flat_map(|c| page.query_document_all(&c.selector))
            .collect();
        self.inspect_all(page, roots, selectors, guard, sink)
    }

    /// Global batch dispatch: added nodes that are panel roots or contain them.
    pub fn on_added_nodes<S>(
        &mut self,
        page: &mut Page,
        records: &[MutationRecord],
        selectors: &Selectors,
        guard: &mut MountGuard,
        sink: &mut S,
    ) -> Result<usize>
    where
        S: OverlaySink + ?Sized,
    {
        let mut roots = Vec::new();
        for record in records.iter().filter(|r| r.kind == MutationKind::ChildList) {
            for &node in &record.added {
                if page.element(node).is_none()
                    || !page.is_attached(node)
                    || page.is_isolated(node)
                {
                    continue;
                }
                for candidate in selectors.panel_root.iter() {
                    if page.matches(node, &candidate.selector) {
                        roots.push(node);
                    }
                    roots.extend(page.query_all(node, &candidate.selector));
                }
            }
        }
        self.inspect_all(page, roots, selectors, guard, sink)
    }

    /// A panel-scoped subscription fired. Returns true when the panel mounted.
    pub fn on_panel_batch<S>(
        &mut self,
        page: &mut Page,
        observer: ObserverId,
        selectors: &Selectors,
        guard: &mut MountGuard,
        sink: &mut S,
    ) -> Result<bool>
    where
        S: OverlaySink + ?Sized,
    {
        let Some(root) = self.owner(observer) else {
            // Already mounted or swept; the batch was queued before disconnect.
            page.disconnect(observer);
            return Ok(false);
        };
        if !page.is_attached(root) {
            self.forget(page, root);
            return Ok(false);
        }
        self.inspect(page, root, selectors, guard, sink)
    }

    /// Disconnect and forget watchers whose root left the document. Returns how
    /// many entries were dropped.
    pub fn sweep_detached(&mut self, page: &mut Page) -> usize {
        let gone: Vec<NodeId> = self
            .states
            .keys()
            .copied()
            .filter(|root| !page.is_attached(*root))
            .collect();
        for root in &gone {
            self.forget(page, *root);
        }
        gone.len()
    }

    fn forget(&mut self, page: &mut Page, root: NodeId) {
        if let Some(PanelState::Watching(observer)) = self.states.remove(&root) {
            page.disconnect(observer);
            debug!(?observer, "panel detached before becoming ready");
        }
    }

    fn inspect_all<S>(
        &mut self,
        page: &mut Page,
        mut roots: Vec<NodeId>,
        selectors: &Selectors,
        guard: &mut MountGuard,
        sink: &mut S,
    ) -> Result<usize>
    where
        S: OverlaySink + ?Sized,
    {
        let mut seen = std::collections::HashSet::new();
        roots.retain(|r| seen.insert(*r));
        let mut mounted = 0;
        for root in roots {
            if self.inspect(page, root, selectors, guard, sink)? {
                mounted += 1;
            }
        }
        Ok(mounted)
    }

    /// Mount when both parts exist, otherwise make sure the root is watched.
    fn inspect<S>(
        &mut self,
        page: &mut Page,
        root: NodeId,
        selectors: &Selectors,
        guard: &mut MountGuard,
        sink: &mut S,
    ) -> Result<bool>
    where
        S: OverlaySink + ?Sized,
    {
        let state = self.state(root);
        if state == PanelState::Mounted {
            return Ok(false);
        }

        let parts = find_trigger(page, root, selectors)
            .and_then(|t| find_content(page, root, t, selectors).map(|c| (t, c)));
        let Some((trigger, content)) = parts else {
            if state == PanelState::Unwatched {
                let observer = page.observe(root, ObserveOptions::panel());
                self.states.insert(root, PanelState::Watching(observer));
                debug!(?observer, "panel incomplete, watching");
            }
            return Ok(false);
        };

        if let PanelState::Watching(observer) = state {
            page.disconnect(observer);
        }
        self.states.insert(root, PanelState::Mounted);

        let locator = self.locator_for(page, root);
        let mount = PanelMount {
            trigger,
            content,
            root,
            locator,
        };
        let result = guard.mount(
            page,
            MountKind::Translation,
            root,
            Anchor::After(trigger),
            |page, host| sink.mount_widget(page, host, &mount),
        );
        match result {
            Ok(host) => {
                if host.is_some() {
                    info!(locator = %mount.locator.root_id, "thoughts panel ready");
                }
                Ok(host.is_some())
            }
            Err(e) => {
                // Watch again so the next change inside the panel retries.
                let observer = page.observe(root, ObserveOptions::panel());
                self.states.insert(root, PanelState::Watching(observer));
                Err(e)
            }
        }
    }

    fn locator_for(&mut self, page: &mut Page, root: NodeId) -> PanelLocator {
        if let Some(id) = page.attr(root, "id").filter(|id| !id.is_empty()) {
            return PanelLocator {
                root_id: id.to_string(),
            };
        }
        self.next_locator += 1;
        let root_id = format!("{LOCATOR_PREFIX}{}", self.next_locator);
        page.set_attr(root, "id", &root_id);
        PanelLocator { root_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augmenter::CollectingSink;
    use crate::config::AugmentConfig;
    use scraper::Selector;

    fn selectors() -> Selectors {
        AugmentConfig::default().compile().unwrap()
    }

    fn sel(s: &str) -> Selector {
        Selector::parse(s).unwrap()
    }

    const TRIGGER: &str = "<button data-test-id='thoughts-header-button'>Show thinking</button>";
    const CONTENT: &str = "<div data-test-id='thoughts-content'><p>Reasoning</p></div>";

    #[test]
    fn complete_panel_mounts_without_subscription() {
        let mut page = Page::parse(&format!(
            "<body><model-thoughts>{TRIGGER}{CONTENT}</model-thoughts></body>"
        ));
        let (sel_, mut guard, mut sink) = (selectors(), MountGuard::default(), CollectingSink::default());
        let mut watcher = PanelWatcher::default();
        let observers_before = page.observer_count();

        let mounted = watcher.scan(&mut page, &sel_, &mut guard, &mut sink).unwrap();
        assert_eq!(mounted, 1);
        let root = page.query_document(&sel("model-thoughts")).unwrap();
        assert_eq!(watcher.state(root), PanelState::Mounted);
        assert_eq!(page.observer_count(), observers_before);
        assert_eq!(sink.widgets().len(), 1);
        assert_eq!(sink.widgets()[0].root_id, "chat-lens-thoughts-1");
        assert_eq!(page.attr(root, "id"), Some("chat-lens-thoughts-1"));
    }

    #[test]
    fn partial_panel_is_watched_then_mounted_once() {
        let mut page = Page::parse(&format!(
            "<body><model-thoughts id='panel-one'>{TRIGGER}</model-thoughts></body>"
        ));
        let (sel_, mut guard, mut sink) = (selectors(), MountGuard::default(), CollectingSink::default());
        let mut watcher = PanelWatcher::default();
        watcher.scan(&mut page, &sel_, &mut guard, &mut sink).unwrap();

        let root = page.query_document(&sel("model-thoughts")).unwrap();
        let PanelState::Watching(observer) = watcher.state(root) else {
            panic!("expected Watching, got {:?}", watcher.state(root));
        };
        assert_eq!(watcher.watching_count(), 1);

        // Rescanning does not add a second subscription.
        watcher.scan(&mut page, &sel_, &mut guard, &mut sink).unwrap();
        assert_eq!(page.observer_count(), 1);

        page.append_html(root, CONTENT);
        for (id, _) in page.take_records() {
            watcher
                .on_panel_batch(&mut page, id, &sel_, &mut guard, &mut sink)
                .unwrap();
        }
        assert_eq!(watcher.state(root), PanelState::Mounted);
        assert!(!page.is_observing(observer));
        assert_eq!(watcher.watching_count(), 0);
        assert_eq!(sink.widgets().len(), 1);
        assert_eq!(sink.widgets()[0].root_id, "panel-one");
    }

    #[test]
    fn content_falls_back_to_trigger_sibling() {
        let mut page = Page::parse(&format!(
            "<body><model-thoughts>{TRIGGER}<section class='body'>text</section></model-thoughts></body>"
        ));
        let (sel_, mut guard, mut sink) = (selectors(), MountGuard::default(), CollectingSink::default());
        let mut watcher = PanelWatcher::default();
        watcher.scan(&mut page, &sel_, &mut guard, &mut sink).unwrap();

        let locator = PanelLocator {
            root_id: sink.widgets()[0].root_id.clone(),
        };
        let content = locator.resolve_content(&page, &sel_).unwrap();
        assert_eq!(page.tag_name(content), Some("section"));
    }

    #[test]
    fn added_roots_are_dispatched() {
        let mut page = Page::parse("<body><main></main></body>");
        let main = page.query_document(&sel("main")).unwrap();
        let body_observer = page.observe(page.body().unwrap(), ObserveOptions::subtree_children());
        let (sel_, mut guard, mut sink) = (selectors(), MountGuard::default(), CollectingSink::default());
        let mut watcher = PanelWatcher::default();

        page.append_html(
            main,
            &format!("<div class='turn'><model-thoughts>{TRIGGER}{CONTENT}</model-thoughts></div>"),
        );
        let batches = page.take_records();
        assert_eq!(batches[0].0, body_observer);
        let mounted = watcher
            .on_added_nodes(&mut page, &batches[0].1, &sel_, &mut guard, &mut sink)
            .unwrap();
        assert_eq!(mounted, 1);
    }

    #[test]
    fn detached_watching_root_is_swept() {
        let mut page = Page::parse(&format!(
            "<body><model-thoughts>{TRIGGER}</model-thoughts></body>"
        ));
        let (sel_, mut guard, mut sink) = (selectors(), MountGuard::default(), CollectingSink::default());
        let mut watcher = PanelWatcher::default();
        watcher.scan(&mut page, &sel_, &mut guard, &mut sink).unwrap();
        let root = page.query_document(&sel("model-thoughts")).unwrap();
        assert_eq!(page.observer_count(), 1);

        page.remove(root);
        assert_eq!(watcher.sweep_detached(&mut page), 1);
        assert_eq!(page.observer_count(), 0);
        assert_eq!(watcher.state(root), PanelState::Unwatched);
        assert!(sink.widgets().is_empty());
    }

    #[test]
    fn failed_widget_goes_back_to_watching() {
        let mut page = Page::parse(&format!(
            "<body><model-thoughts>{TRIGGER}{CONTENT}</model-thoughts></body>"
        ));
        let sel_ = selectors();
        let mut guard = MountGuard::default();
        let mut sink = CollectingSink::failing_widgets();
        let mut watcher = PanelWatcher::default();
        assert!(watcher.scan(&mut page, &sel_, &mut guard, &mut sink).is_err());
        let root = page.query_document(&sel("model-thoughts")).unwrap();
        assert!(matches!(watcher.state(root), PanelState::Watching(_)));
        assert!(!guard.is_mounted(MountKind::Translation, root));
    }
}
