//! One-shot widget mounting.
//!
//! Every piece of injected UI lives in a host element carrying the isolation
//! boundary marker, so host-page queries never see it and host styles never
//! reach it. `MountGuard` remembers what has been mounted in a side table keyed
//! by `(kind, root)`; the host page's own attributes are never used as markers.

use std::collections::HashSet;
use std::fmt;

use anyhow::{bail, Result};
use ego_tree::NodeId;
use tracing::{debug, warn};

use crate::dom::{Page, BOUNDARY_ATTR};

/// What a mount point carries. Part of the guard key, so one element can host
/// different widgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountKind {
    Timeline,
    Translation,
    Autosave,
}

impl MountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountKind::Timeline => "timeline",
            MountKind::Translation => "translation",
            MountKind::Autosave => "autosave",
        }
    }
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the host element goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Immediately after the node; appended into it when it has no parent.
    After(NodeId),
    /// As the node's last child.
    AppendTo(NodeId),
}

#[derive(Debug, Default)]
pub struct MountGuard {
    mounted: HashSet<(MountKind, NodeId)>,
}

impl MountGuard {
    pub fn is_mounted(&self, kind: MountKind, key: NodeId) -> bool {
        self.mounted.contains(&(kind, key))
    }

    pub fn len(&self) -> usize {
        self.mounted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty()
    }

    pub fn clear(&mut self) {
        self.mounted.clear();
    }

    /// Forget keys whose element left the document.
    pub fn forget_detached(&mut self, page: &Page) {
        self.mounted.retain(|(_, key)| page.is_attached(*key));
    }

    /// Mount once per `(kind, key)`. Returns the new host, or `None` when the
    /// key was already mounted. The check and the claim happen under one
    /// `&mut self` borrow with nothing in between.
    ///
    /// A failing factory removes the host and releases the claim, leaving the
    /// page as it was so a later pass can retry.
    pub fn mount<F>(
        &mut self,
        page: &mut Page,
        kind: MountKind,
        key: NodeId,
        anchor: Anchor,
        factory: F,
    ) -> Result<Option<NodeId>>
    where
        F: FnOnce(&mut Page, NodeId) -> Result<()>,
    {
        if !self.mounted.insert((kind, key)) {
            return Ok(None);
        }

        let Some(host) = insert_host(page, kind, anchor) else {
            self.mounted.remove(&(kind, key));
            bail!("{kind} mount anchor is no longer in the document");
        };

        if let Err(e) = factory(page, host) {
            warn!(kind = %kind, error = %e, "widget factory failed, rolling back");
            page.remove(host);
            self.mounted.remove(&(kind, key));
            return Err(e.context(format!("failed to build {kind} widget")));
        }

        debug!(kind = %kind, "widget mounted");
        Ok(Some(host))
    }
}

fn insert_host(page: &mut Page, kind: MountKind, anchor: Anchor) -> Option<NodeId> {
    let fragment = format!("<div {BOUNDARY_ATTR}=\"{kind}\"></div>");
    let added = match anchor {
        Anchor::After(node) if page.parent(node).is_some() => {
            page.insert_html_after(node, &fragment)
        }
        Anchor::After(node) | Anchor::AppendTo(node) => page.append_html(node, &fragment),
    };
    added.first().copied()
}
