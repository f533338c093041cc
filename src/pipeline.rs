use anyhow::{Context, Result};
use ego_tree::NodeId;
use serde::Serialize;
use tracing::debug;

use crate::augmenter::OverlaySink;
use crate::config::{AugmentConfig, Selectors};
use crate::discovery::{discover, resolve_containers, SelectorState};
use crate::dom::{MessageItem, Page};
use crate::identity::{assign_id, IdentityCache, HASH_ID_PREFIX};
use crate::text::{normalize_text, summarize};

/// Keep only elements that are not descendants of another element in the set.
/// Relative order is preserved. Quadratic, but n is the number of visible chat
/// turns.
pub fn filter_top_level(page: &Page, elements: &[NodeId]) -> Vec<NodeId> {
    elements
        .iter()
        .copied()
        .filter(|&el| {
            !elements
                .iter()
                .any(|&other| other != el && page.contains(other, el))
        })
        .collect()
}

/// A content-hash id given to an element that had no id of its own. A live
/// tab needs the same id written back, or the next snapshot would rehash an
/// edited message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdWrite {
    /// Position among the top-level matches of the pinned selector.
    pub index: usize,
    pub id: String,
    /// Normalized text the hash was taken from.
    pub text: String,
}

/// State the reconciliation loop carries between passes: the pinned selector
/// and the per-element id cache. One per page session; nothing here is global.
#[derive(Debug, Default)]
pub struct ReconcileContext {
    selectors: SelectorState,
    ids: IdentityCache,
    writes: Vec<IdWrite>,
}

impl ReconcileContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selector_state(&self) -> &SelectorState {
        &self.selectors
    }

    pub fn ids(&self) -> &IdentityCache {
        &self.ids
    }

    /// Forget the pinned selector. The live watcher calls this when the page URL
    /// changes; nothing else ever un-pins.
    pub fn reset_discovery(&mut self) {
        self.selectors.reset();
    }

    /// Drop per-document state but keep the pinned selector, for a fresh
    /// snapshot of the same session.
    pub fn next_document(&mut self) {
        self.ids.clear();
        self.writes.clear();
    }

    /// Hash ids assigned since the last call.
    pub fn take_id_writes(&mut self) -> Vec<IdWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Forget ids of elements that left the document.
    pub fn prune(&mut self, page: &Page) {
        self.ids.prune(page);
    }

    /// One reconciliation pass. Publishes the ordered item list to `sink` and
    /// returns its length, or `None` on a discovery miss (nothing published).
    pub fn run<S>(
        &mut self,
        page: &mut Page,
        selectors: &Selectors,
        config: &AugmentConfig,
        sink: &mut S,
    ) -> Result<Option<usize>>
    where
        S: OverlaySink + ?Sized,
    {
        let containers = resolve_containers(page, &selectors.containers);
        let Some(found) = discover(page, &containers, &selectors.messages, &mut self.selectors)
        else {
            debug!(containers = containers.len(), "no message selector matches yet");
            return Ok(None);
        };
        let Some(candidate) = found.selector(&selectors.messages) else {
            return Ok(None);
        };

        let raw = page.query_all(found.container, &candidate.selector);
        let elements = filter_top_level(page, &raw);

        let mut items = Vec::with_capacity(elements.len());
        for (index, element) in elements.into_iter().enumerate() {
            let content = selectors
                .message_content
                .iter()
                .find_map(|c| page.query(element, &c.selector))
                .unwrap_or(element);
            let clean = normalize_text(&page.text_content(content));
            let mut summary = summarize(&clean, config.summary_chars);
            if summary.is_empty() {
                summary = format!("Query {}", index + 1);
            }
            let fresh = self.ids.get(element).is_none() && page.attr(element, "id").is_none();
            let id = assign_id(
                page,
                &mut self.ids,
                element,
                index,
                &clean,
                config.native_id_min_len,
            );
            if fresh && id.starts_with(HASH_ID_PREFIX) {
                self.writes.push(IdWrite {
                    index,
                    id: id.clone(),
                    text: clean.clone(),
                });
            }
            items.push(MessageItem { id, text: summary });
        }

        debug!(
            raw = raw.len(),
            items = items.len(),
            selector = %candidate.source,
            "reconciled messages"
        );
        let count = items.len();
        sink.update_items(items).context("timeline sink rejected update")?;
        Ok(Some(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augmenter::CollectingSink;
    use scraper::Selector;

    fn sel(s: &str) -> Selector {
        Selector::parse(s).unwrap()
    }

    fn run(page: &mut Page, ctx: &mut ReconcileContext) -> (Option<usize>, Vec<MessageItem>) {
        let config = AugmentConfig::default();
        let selectors = config.compile().unwrap();
        let mut sink = CollectingSink::default();
        let count = ctx.run(page, &selectors, &config, &mut sink).unwrap();
        (count, sink.items().to_vec())
    }

    #[test]
    fn nested_matches_are_filtered_in_order() {
        let page = Page::parse(
            "<body><div class='m' id='a'><div class='m' id='a1'></div></div>\
             <div class='m' id='b'></div><div class='m' id='c'><span><div class='m'></div></span></div></body>",
        );
        let all = page.query_document_all(&sel(".m"));
        assert_eq!(all.len(), 5);
        let top = filter_top_level(&page, &all);
        let ids: Vec<_> = top.iter().map(|&n| page.attr(n, "id").unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn filter_handles_empty_and_disjoint_sets() {
        let page = Page::parse("<body><p>1</p><p>2</p></body>");
        assert!(filter_top_level(&page, &[]).is_empty());
        let all = page.query_document_all(&sel("p"));
        assert_eq!(filter_top_level(&page, &all), all);
    }

    #[test]
    fn summaries_prefer_content_element_and_fall_back_to_query_label() {
        let mut page = Page::parse(
            "<body><main>\
             <div class='user-query'><span>chrome</span><div class='user-query-content'>  What is a borrow checker anyway  </div></div>\
             <div class='user-query'><p>Short</p></div>\
             <div class='user-query'>   </div>\
             </main></body>",
        );
        let mut ctx = ReconcileContext::new();
        let (count, items) = run(&mut page, &mut ctx);
        assert_eq!(count, Some(3));
        assert_eq!(items[0].text, "What is a borrow che");
        assert_eq!(items[1].text, "Short");
        assert_eq!(items[2].text, "Query 3");
        assert_eq!(items[2].id, "u-0");
    }

    #[test]
    fn discovery_miss_publishes_nothing() {
        let mut page = Page::parse("<body><main><p>no messages</p></main></body>");
        let mut ctx = ReconcileContext::new();
        let (count, items) = run(&mut page, &mut ctx);
        assert_eq!(count, None);
        assert!(items.is_empty());
        assert!(!ctx.selector_state().is_pinned());
    }

    #[test]
    fn repeated_passes_are_identical() {
        let mut page = Page::parse(
            "<body><main><div class='user-query'>one</div><div class='user-query'>two</div></main></body>",
        );
        let mut ctx = ReconcileContext::new();
        let (_, first) = run(&mut page, &mut ctx);
        let (_, second) = run(&mut page, &mut ctx);
        assert_eq!(first, second);
        assert_eq!(ctx.ids().len(), 2);
    }

    #[test]
    fn fresh_hash_ids_are_queued_for_write_back() {
        let mut page = Page::parse(
            "<body><main><div class='user-query'>Hello</div>\
             <div class='user-query' id='turn-8842'>kept</div>\
             <div class='user-query' id='a1'>Hi</div></main></body>",
        );
        let mut ctx = ReconcileContext::new();
        run(&mut page, &mut ctx);
        assert_eq!(
            ctx.take_id_writes(),
            vec![IdWrite {
                index: 0,
                id: "u-42628b2".into(),
                text: "Hello".into(),
            }]
        );

        // Cached on the next pass, so nothing new to write.
        run(&mut page, &mut ctx);
        assert!(ctx.take_id_writes().is_empty());
    }

    #[test]
    fn pinned_selector_yields_empty_list_after_messages_vanish() {
        let mut page = Page::parse("<body><main><div class='user-query'>one</div></main></body>");
        let mut ctx = ReconcileContext::new();
        run(&mut page, &mut ctx);
        let msg = page.query_document(&sel(".user-query")).unwrap();
        page.remove(msg);
        let (count, items) = run(&mut page, &mut ctx);
        assert_eq!(count, Some(0));
        assert!(items.is_empty());
    }
}
