//! Selector discovery: which candidate selector marks user messages in the
//! current page version, and which container they live in.
//!
//! Containers are probed in priority order (main content first, then named
//! history containers, the document body last) so a sidebar that happens to
//! match a low-priority pattern cannot capture discovery. Once a selector
//! matches anything it is pinned and never re-tried against higher-priority
//! candidates.

use ego_tree::NodeId;
use tracing::{debug, info};

use crate::config::{CandidateSelector, SelectorList};
use crate::dom::Page;

/// The active message selector. Starts empty; pinned by the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectorState {
    active: Option<usize>,
}

impl SelectorState {
    pub fn is_pinned(&self) -> bool {
        self.active.is_some()
    }

    /// Index of the pinned candidate.
    pub fn active(&self) -> Option<usize> {
        self.active
    }

    /// Forget the pinned selector so the next pass searches from scratch.
    pub fn reset(&mut self) {
        self.active = None;
    }
}

/// Result of a discovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    pub container: NodeId,
    /// Index into the message selector list.
    pub selector: usize,
}

impl Discovery {
    pub fn selector<'a>(&self, selectors: &'a SelectorList) -> Option<&'a CandidateSelector> {
        selectors.get(self.selector)
    }
}

/// Look the container candidates up fresh: the host page may have replaced them.
pub fn resolve_containers(page: &Page, containers: &SelectorList) -> Vec<NodeId> {
    containers
        .iter()
        .filter_map(|c| page.query_document(&c.selector))
        .collect()
}

pub fn discover(
    page: &Page,
    containers: &[NodeId],
    selectors: &SelectorList,
    state: &mut SelectorState,
) -> Option<Discovery> {
    match state.active {
        None => {
            for &container in containers {
                for (index, candidate) in selectors.iter().enumerate() {
                    if page.query(container, &candidate.selector).is_some() {
                        state.active = Some(index);
                        info!(
                            selector = %candidate.source,
                            index = index,
                            "message selector discovered"
                        );
                        return Some(Discovery {
                            container,
                            selector: index,
                        });
                    }
                }
            }
            None
        }
        Some(index) => {
            let candidate = selectors.get(index)?;
            let container = containers
                .iter()
                .copied()
                .find(|&c| page.query(c, &candidate.selector).is_some())
                .or_else(|| {
                    // Report an empty timeline instead of silently doing nothing.
                    debug!(selector = %candidate.source, "pinned selector matches nothing");
                    containers.first().copied()
                })?;
            Some(Discovery {
                container,
                selector: index,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> SelectorList {
        let owned: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        SelectorList::compile(&owned).unwrap()
    }

    fn containers(page: &Page) -> Vec<NodeId> {
        resolve_containers(page, &list(&["main", "#history", "body"]))
    }

    #[test]
    fn containers_resolve_in_priority_order_without_nulls() {
        let page = Page::parse("<body><div id='history'></div><main></main></body>");
        let found = containers(&page);
        assert_eq!(found.len(), 3);
        assert_eq!(page.tag_name(found[0]), Some("main"));
        assert_eq!(page.attr(found[1], "id"), Some("history"));
        assert_eq!(Some(found[2]), page.body());

        let bare = Page::parse("<body><p>x</p></body>");
        assert_eq!(containers(&bare), vec![bare.body().unwrap()]);
    }

    #[test]
    fn first_container_with_any_match_wins() {
        let page = Page::parse(
            "<body><div id='history'><div class='q'>sidebar</div></div>\
             <main><div class='b'>hello</div></main></body>",
        );
        let selectors = list(&[".a", ".b", ".q"]);
        let mut state = SelectorState::default();
        let found = discover(&page, &containers(&page), &selectors, &mut state).unwrap();
        // main is probed before the history container, so ".b" wins over ".q".
        assert_eq!(page.tag_name(found.container), Some("main"));
        assert_eq!(found.selector, 1);
        assert_eq!(state.active(), Some(1));
    }

    #[test]
    fn no_match_leaves_state_empty() {
        let page = Page::parse("<body><main><p>nothing</p></main></body>");
        let mut state = SelectorState::default();
        assert!(discover(&page, &containers(&page), &list(&[".a"]), &mut state).is_none());
        assert!(!state.is_pinned());
    }

    #[test]
    fn pinned_selector_is_never_replaced() {
        let mut page = Page::parse("<body><main><div class='b'>x</div></main></body>");
        let selectors = list(&[".a", ".b"]);
        let mut state = SelectorState::default();
        discover(&page, &containers(&page), &selectors, &mut state).unwrap();
        assert_eq!(state.active(), Some(1));

        // A higher-priority selector starts matching later.
        let main = containers(&page)[0];
        page.append_html(main, "<div class='a'>y</div>");
        let again = discover(&page, &containers(&page), &selectors, &mut state).unwrap();
        assert_eq!(again.selector, 1);
        assert_eq!(state.active(), Some(1));
    }

    #[test]
    fn pinned_selector_falls_back_to_primary_container() {
        let mut page = Page::parse("<body><main><div class='b'>x</div></main></body>");
        let selectors = list(&[".b"]);
        let mut state = SelectorState::default();
        let first = discover(&page, &containers(&page), &selectors, &mut state).unwrap();
        let message = page.query(first.container, &selectors.get(0).unwrap().selector).unwrap();
        page.remove(message);

        let found = discover(&page, &containers(&page), &selectors, &mut state).unwrap();
        assert_eq!(page.tag_name(found.container), Some("main"));
        assert_eq!(found.selector, 0);
    }

    #[test]
    fn pinned_selector_follows_matches_to_lower_priority_container() {
        let page = Page::parse(
            "<body><main><p>empty</p></main><div id='history'><div class='b'>x</div></div></body>",
        );
        let selectors = list(&[".b"]);
        let mut state = SelectorState::default();
        let found = discover(&page, &containers(&page), &selectors, &mut state).unwrap();
        assert_eq!(page.attr(found.container, "id"), Some("history"));
    }

    #[test]
    fn reset_allows_rediscovery() {
        let page = Page::parse("<body><main><div class='a'>x</div><div class='b'>y</div></main></body>");
        let mut state = SelectorState::default();
        discover(&page, &containers(&page), &list(&[".b"]), &mut state).unwrap();
        state.reset();
        let found = discover(&page, &containers(&page), &list(&[".a", ".b"]), &mut state).unwrap();
        assert_eq!(found.selector, 0);
    }
}
