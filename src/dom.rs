//! Live document model the engine runs against.
//!
//! `Page` wraps a parsed `scraper::Html` and adds the mutation surface a host
//! page exercises (appending fragments, removing nodes, editing attributes and
//! text), queuing a [`MutationRecord`] for every change so subscribers can
//! react in batches. Node identity is the ego-tree `NodeId`: it never changes
//! for the lifetime of the node and is never reused once the node is detached.

use ego_tree::{NodeId, NodeRef, Tree};
use html5ever::{Attribute, LocalName, QualName};
use scraper::node::{Element, Text};
use scraper::{ElementRef, Html, Node, Selector, StrTendril};
use serde::Serialize;

use crate::mutation::{MutationRecord, ObserveOptions, ObserverId, ObserverRegistry};

/// Marker attribute for an isolated rendering boundary (our stand-in for a
/// shadow root). Queries never return elements below a boundary host.
pub const BOUNDARY_ATTR: &str = "data-chat-lens-boundary";

/// One entry of the message timeline, rebuilt on every reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageItem {
    pub id: String,
    pub text: String,
}

/// Mirrors `document.readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

pub struct Page {
    html: Html,
    ready: ReadyState,
    observers: ObserverRegistry,
}

impl Page {
    /// Parse a fully loaded document.
    pub fn parse(html: &str) -> Self {
        Self {
            html: Html::parse_document(html),
            ready: ReadyState::Complete,
            observers: ObserverRegistry::default(),
        }
    }

    /// Parse a document that has not finished loading yet.
    pub fn loading(html: &str) -> Self {
        Self {
            ready: ReadyState::Loading,
            ..Self::parse(html)
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready
    }

    pub fn set_ready_state(&mut self, state: ReadyState) {
        self.ready = state;
    }

    pub fn html(&self) -> String {
        self.html.html()
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    pub fn root_element(&self) -> NodeId {
        self.html.root_element().id()
    }

    pub fn body(&self) -> Option<NodeId> {
        self.html
            .root_element()
            .child_elements()
            .find(|el| el.value().name() == "body")
            .map(|el| el.id())
    }

    pub fn element(&self, id: NodeId) -> Option<ElementRef<'_>> {
        self.html.tree.get(id).and_then(ElementRef::wrap)
    }

    pub fn tag_name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|el| el.value().name())
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|el| el.value().attr(name))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.html.tree.get(id)?.parent().map(|p| p.id())
    }

    /// Whether the node is still reachable from the document root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        contains_in(&self.html.tree, self.html.tree.root().id(), id)
    }

    /// Inclusive containment, like `Node.contains`.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        contains_in(&self.html.tree, ancestor, node)
    }

    /// True when a strict ancestor of `id` is an isolation boundary host.
    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.html
            .tree
            .get(id)
            .map(|node| {
                node.ancestors()
                    .filter_map(ElementRef::wrap)
                    .any(|el| el.value().attr(BOUNDARY_ATTR).is_some())
            })
            .unwrap_or(false)
    }

    pub fn matches(&self, id: NodeId, selector: &Selector) -> bool {
        self.element(id)
            .map(|el| selector.matches(&el))
            .unwrap_or(false)
    }

    /// First descendant of `scope` matching `selector`, in document order.
    pub fn query(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        let scope = self.element(scope)?;
        scope
            .select(selector)
            .map(|el| el.id())
            .find(|id| !self.is_isolated(*id))
    }

    /// All descendants of `scope` matching `selector`, in document order.
    pub fn query_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        let Some(scope) = self.element(scope) else {
            return Vec::new();
        };
        scope
            .select(selector)
            .map(|el| el.id())
            .filter(|id| !self.is_isolated(*id))
            .collect()
    }

    pub fn query_document(&self, selector: &Selector) -> Option<NodeId> {
        self.query(self.root_element(), selector)
    }

    pub fn query_document_all(&self, selector: &Selector) -> Vec<NodeId> {
        self.query_all(self.root_element(), selector)
    }

    /// Like `getElementById`, ignoring anything behind a boundary.
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.html
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().id() == Some(id) && !self.is_isolated(el.id()))
            .map(|el| el.id())
    }

    /// The next element sibling, skipping injected boundary hosts.
    pub fn next_element_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.html
            .tree
            .get(id)?
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().attr(BOUNDARY_ATTR).is_none())
            .map(|el| el.id())
    }

    /// Nearest inclusive ancestor element carrying `attr`, like `closest('[attr]')`.
    pub fn closest_with_attr(&self, id: NodeId, attr: &str) -> Option<NodeId> {
        let node = self.html.tree.get(id)?;
        std::iter::once(node)
            .chain(node.ancestors())
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().attr(attr).is_some())
            .map(|el| el.id())
    }

    /// Concatenated descendant text, like `textContent`. Text behind a
    /// boundary host is left out, as shadow content is.
    pub fn text_content(&self, id: NodeId) -> String {
        let Some(node) = self.html.tree.get(id) else {
            return String::new();
        };
        if let Node::Text(text) = node.value() {
            return String::from(&**text);
        }
        self.text_nodes(id)
            .into_iter()
            .filter_map(|n| self.html.tree.get(n))
            .filter_map(|n| n.value().as_text().map(|t| &**t))
            .collect()
    }

    /// Descendant text nodes of `id` in document order, skipping boundary
    /// host subtrees.
    pub fn text_nodes(&self, id: NodeId) -> Vec<NodeId> {
        self.html
            .tree
            .get(id)
            .map(|node| {
                node.descendants()
                    .filter(|n| n.value().is_text())
                    .filter(|n| !behind_boundary(*n, id))
                    .map(|n| n.id())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Parse `fragment` and append its top-level nodes to `parent`.
    pub fn append_html(&mut self, parent: NodeId, fragment: &str) -> Vec<NodeId> {
        if self.element(parent).is_none() {
            return Vec::new();
        }
        let source = Html::parse_fragment(fragment);
        let added: Vec<NodeId> = source
            .root_element()
            .children()
            .filter_map(|child| graft(&mut self.html.tree, parent, child))
            .collect();
        if !added.is_empty() {
            self.record(MutationRecord::child_list(parent, added.clone(), vec![]));
        }
        added
    }

    /// Parse `fragment` and insert its top-level nodes right after `sibling`.
    pub fn insert_html_after(&mut self, sibling: NodeId, fragment: &str) -> Vec<NodeId> {
        let Some(parent) = self.parent(sibling) else {
            return Vec::new();
        };
        let source = Html::parse_fragment(fragment);
        let mut added = Vec::new();
        let mut anchor = sibling;
        for child in source.root_element().children() {
            let Some(mut anchor_node) = self.html.tree.get_mut(anchor) else {
                break;
            };
            let id = anchor_node.insert_after(child.value().clone()).id();
            for grandchild in child.children() {
                graft(&mut self.html.tree, id, grandchild);
            }
            added.push(id);
            anchor = id;
        }
        if !added.is_empty() {
            self.record(MutationRecord::child_list(parent, added.clone(), vec![]));
        }
        added
    }

    /// Detach `id` from its parent. Returns false when it was already detached.
    pub fn remove(&mut self, id: NodeId) -> bool {
        let Some(parent) = self.parent(id) else {
            return false;
        };
        if let Some(mut node) = self.html.tree.get_mut(id) {
            node.detach();
        }
        self.record(MutationRecord::child_list(parent, vec![], vec![id]));
        true
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) -> bool {
        let updated = self.rebuild_attrs(id, name, |attrs| {
            attrs.push(Attribute {
                name: QualName::new(None, html5ever::ns!(), LocalName::from(name)),
                value: StrTendril::from_slice(value),
            });
        });
        if updated {
            self.record(MutationRecord::attribute(id, name));
        }
        updated
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> bool {
        if self.attr(id, name).is_none() {
            return false;
        }
        let updated = self.rebuild_attrs(id, name, |_| {});
        if updated {
            self.record(MutationRecord::attribute(id, name));
        }
        updated
    }

    /// Replace all children of an element with a single text node (`textContent = ...`).
    pub fn set_text(&mut self, id: NodeId, text: &str) -> bool {
        let Some(node) = self.html.tree.get(id) else {
            return false;
        };
        if !node.value().is_element() {
            return false;
        }
        let removed: Vec<NodeId> = node.children().map(|c| c.id()).collect();
        for child in &removed {
            if let Some(mut child) = self.html.tree.get_mut(*child) {
                child.detach();
            }
        }
        let mut added = Vec::new();
        if let Some(mut node) = self.html.tree.get_mut(id) {
            if !text.is_empty() {
                let text_node = Node::Text(Text {
                    text: StrTendril::from_slice(text),
                });
                added.push(node.append(text_node).id());
            }
        }
        self.record(MutationRecord::child_list(id, added, removed));
        true
    }

    /// Overwrite the data of a text node.
    pub fn set_text_node(&mut self, id: NodeId, text: &str) -> bool {
        let Some(mut node) = self.html.tree.get_mut(id) else {
            return false;
        };
        let Node::Text(current) = node.value() else {
            return false;
        };
        current.text = StrTendril::from_slice(text);
        self.record(MutationRecord::character_data(id));
        true
    }

    fn rebuild_attrs<F>(&mut self, id: NodeId, name: &str, extend: F) -> bool
    where
        F: FnOnce(&mut Vec<Attribute>),
    {
        let Some(mut node) = self.html.tree.get_mut(id) else {
            return false;
        };
        let Node::Element(element) = node.value() else {
            return false;
        };
        // Element caches id/classes lazily, so rebuild rather than edit in place.
        let mut attrs: Vec<Attribute> = element
            .attrs
            .iter()
            .filter(|(qual, _)| &*qual.local != name)
            .map(|(qual, value)| Attribute {
                name: qual.clone(),
                value: value.clone(),
            })
            .collect();
        extend(&mut attrs);
        *element = Element::new(element.name.clone(), attrs);
        true
    }

    // ── Observation ─────────────────────────────────────────────────────────

    pub fn observe(&mut self, target: NodeId, options: ObserveOptions) -> ObserverId {
        self.observers.observe(target, options)
    }

    pub fn disconnect(&mut self, id: ObserverId) -> bool {
        self.observers.disconnect(id)
    }

    pub fn is_observing(&self, id: ObserverId) -> bool {
        self.observers.is_active(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Drain queued batches, one per observer, in registration order.
    pub fn take_records(&mut self) -> Vec<(ObserverId, Vec<MutationRecord>)> {
        self.observers.take_records()
    }

    pub fn has_pending_records(&self) -> bool {
        self.observers.has_pending()
    }

    fn record(&mut self, record: MutationRecord) {
        let tree = &self.html.tree;
        self.observers
            .queue(record, |ancestor, node| contains_in(tree, ancestor, node));
    }
}

fn contains_in(tree: &Tree<Node>, ancestor: NodeId, node: NodeId) -> bool {
    match tree.get(node) {
        Some(n) => n.id() == ancestor || n.ancestors().any(|a| a.id() == ancestor),
        None => false,
    }
}

/// Whether a boundary host sits between `node` and `scope` (inclusive).
fn behind_boundary(node: NodeRef<'_, Node>, scope: NodeId) -> bool {
    for ancestor in node.ancestors() {
        let is_host = ElementRef::wrap(ancestor)
            .is_some_and(|el| el.value().attr(BOUNDARY_ATTR).is_some());
        if is_host {
            return true;
        }
        if ancestor.id() == scope {
            break;
        }
    }
    false
}

/// Deep-copy `source` (from another tree) as the last child of `parent`.
fn graft(tree: &mut Tree<Node>, parent: NodeId, source: NodeRef<'_, Node>) -> Option<NodeId> {
    let id = tree.get_mut(parent)?.append(source.value().clone()).id();
    for child in source.children() {
        graft(tree, id, child);
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationKind;

    fn sel(s: &str) -> Selector {
        Selector::parse(s).unwrap()
    }

    #[test]
    fn append_html_adds_queryable_nodes() {
        let mut page = Page::parse("<body><main></main></body>");
        let main = page.query_document(&sel("main")).unwrap();
        let added = page.append_html(main, "<p class='x'>one</p><p>two</p>");
        assert_eq!(added.len(), 2);
        assert_eq!(page.query_all(main, &sel("p")).len(), 2);
        assert_eq!(page.text_content(main), "onetwo");
    }

    #[test]
    fn set_attr_refreshes_id_and_class_matching() {
        let mut page = Page::parse("<body><div class='a'>x</div></body>");
        let div = page.query_document(&sel("div.a")).unwrap();
        assert!(page.set_attr(div, "id", "fresh-id"));
        assert!(page.set_attr(div, "class", "b"));
        assert_eq!(page.query_document(&sel("#fresh-id")), Some(div));
        assert_eq!(page.element_by_id("fresh-id"), Some(div));
        assert_eq!(page.query_document(&sel("div.b")), Some(div));
        assert!(page.query_document(&sel("div.a")).is_none());
        assert!(page.remove_attr(div, "class"));
        assert!(page.attr(div, "class").is_none());
    }

    #[test]
    fn removed_nodes_are_detached_but_keep_identity() {
        let mut page = Page::parse("<body><section><p>hi</p></section></body>");
        let p = page.query_document(&sel("p")).unwrap();
        assert!(page.is_attached(p));
        assert!(page.remove(p));
        assert!(!page.is_attached(p));
        assert!(!page.remove(p));
        assert!(page.query_document(&sel("p")).is_none());
        assert_eq!(page.text_content(p), "hi");
    }

    #[test]
    fn boundary_contents_are_invisible_to_queries() {
        let mut page = Page::parse("<body><main><p>host</p></main></body>");
        let main = page.query_document(&sel("main")).unwrap();
        let host = page.append_html(main, &format!("<div {BOUNDARY_ATTR}=''><p>widget</p></div>"))[0];
        assert_eq!(page.query_all(main, &sel("p")).len(), 1);
        assert_eq!(page.query_document(&sel("div")), Some(host));
    }

    #[test]
    fn boundary_text_is_left_out_of_text_content() {
        let mut page = Page::parse("<body><main><p>host</p></main></body>");
        let main = page.query_document(&sel("main")).unwrap();
        let host = page.append_html(main, &format!("<div {BOUNDARY_ATTR}=''><b>widget</b></div>"))[0];
        assert_eq!(page.text_content(main), "host");
        assert_eq!(page.text_nodes(main).len(), 1);
        assert_eq!(page.text_content(host), "");
        let body = page.body().unwrap();
        assert_eq!(page.text_content(body), "host");
    }

    #[test]
    fn next_element_sibling_skips_boundary_hosts() {
        let mut page = Page::parse("<body><button>t</button><div class='c'>c</div></body>");
        let button = page.query_document(&sel("button")).unwrap();
        page.insert_html_after(button, &format!("<div {BOUNDARY_ATTR}=''></div>"));
        let next = page.next_element_sibling(button).unwrap();
        assert_eq!(page.attr(next, "class"), Some("c"));
    }

    #[test]
    fn closest_with_attr_is_inclusive() {
        let page = Page::parse("<body><div id='outer'><span id='inner'><b>x</b></span></div></body>");
        let b = page.query_document(&sel("b")).unwrap();
        let span = page.query_document(&sel("span")).unwrap();
        assert_eq!(page.closest_with_attr(b, "id"), Some(span));
        assert_eq!(page.closest_with_attr(span, "id"), Some(span));
    }

    #[test]
    fn mutations_are_delivered_to_subtree_observers() {
        let mut page = Page::parse("<body><main><p>a</p></main><aside></aside></body>");
        let body = page.body().unwrap();
        let aside = page.query_document(&sel("aside")).unwrap();
        let main = page.query_document(&sel("main")).unwrap();
        let body_obs = page.observe(body, ObserveOptions::subtree_children());
        let aside_obs = page.observe(aside, ObserveOptions::panel());

        page.append_html(main, "<p>b</p>");
        page.set_attr(aside, "data-x", "1");

        let batches = page.take_records();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, body_obs);
        assert_eq!(batches[0].1.len(), 1);
        assert_eq!(batches[0].1[0].kind, MutationKind::ChildList);
        assert_eq!(batches[1].0, aside_obs);
        assert_eq!(batches[1].1[0].attribute.as_deref(), Some("data-x"));
        assert!(!page.has_pending_records());
    }

    #[test]
    fn set_text_and_text_node_edits() {
        let mut page = Page::parse("<body><p>old <b>bold</b></p></body>");
        let p = page.query_document(&sel("p")).unwrap();
        assert!(page.set_text(p, "new"));
        assert_eq!(page.text_content(p), "new");
        let node = page.text_nodes(p)[0];
        assert!(page.set_text_node(node, "newer"));
        assert_eq!(page.text_content(p), "newer");
        assert!(!page.set_text_node(p, "not a text node"));
    }

    #[test]
    fn loading_pages_report_ready_state() {
        let mut page = Page::loading("<body></body>");
        assert_eq!(page.ready_state(), ReadyState::Loading);
        page.set_ready_state(ReadyState::Interactive);
        assert_eq!(page.ready_state(), ReadyState::Interactive);
        assert_eq!(Page::parse("").ready_state(), ReadyState::Complete);
    }
}
