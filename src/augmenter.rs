//! Wires the engine to a page: one coarse body observer, and on every batch
//! a reconcile pass, panel dispatch and an autosave-input probe, each feeding
//! an [`OverlaySink`].

use anyhow::{bail, Context, Result};
use ego_tree::NodeId;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{AugmentConfig, Selectors};
use crate::dom::{MessageItem, Page, ReadyState};
use crate::mount::{Anchor, MountGuard, MountKind};
use crate::mutation::{MutationRecord, ObserveOptions, ObserverId};
use crate::panel::{PanelLocator, PanelMount, PanelWatcher};
use crate::pipeline::{IdWrite, ReconcileContext};

/// Upper bound on delivery rounds per pump. Our own injections cause at most
/// one follow-up round; anything beyond this is a page that never settles.
const MAX_PUMP_ROUNDS: usize = 16;

/// Renders overlay UI. Hosts handed to the sink are isolation-boundary
/// elements the engine already inserted.
pub trait OverlaySink {
    fn mount_timeline(&mut self, _page: &mut Page, _host: NodeId) -> Result<()> {
        Ok(())
    }

    /// Replace the displayed timeline wholesale. Called with unchanged and
    /// empty lists too.
    fn update_items(&mut self, items: Vec<MessageItem>) -> Result<()>;

    /// Called once per panel, with a host placed right after the trigger.
    fn mount_widget(&mut self, page: &mut Page, host: NodeId, panel: &PanelMount) -> Result<()>;

    fn inject_autosave(&mut self, page: &mut Page, host: NodeId, input: NodeId) -> Result<()>;
}

/// What one run of the engine found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub selector: Option<String>,
    pub items: Vec<MessageItem>,
    pub panels: Vec<PanelLocator>,
    pub autosave: bool,
    pub updates: usize,
}

/// Sink that renders minimal placeholder widgets and records every call.
#[derive(Debug, Default)]
pub struct CollectingSink {
    items: Vec<MessageItem>,
    updates: usize,
    timeline: Option<NodeId>,
    widgets: Vec<PanelLocator>,
    autosave: Option<NodeId>,
    fail_widgets: bool,
}

impl CollectingSink {
    /// A sink whose panel widgets always fail to build.
    pub fn failing_widgets() -> Self {
        Self {
            fail_widgets: true,
            ..Self::default()
        }
    }

    pub fn items(&self) -> &[MessageItem] {
        &self.items
    }

    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn timeline(&self) -> Option<NodeId> {
        self.timeline
    }

    pub fn widgets(&self) -> &[PanelLocator] {
        &self.widgets
    }

    pub fn autosave(&self) -> Option<NodeId> {
        self.autosave
    }

    pub fn report(&self, selector: Option<String>) -> ScanReport {
        ScanReport {
            url: None,
            selector,
            items: self.items.clone(),
            panels: self.widgets.clone(),
            autosave: self.autosave.is_some(),
            updates: self.updates,
        }
    }

    /// Forget the last document's widgets; items stay until the next update.
    fn clear_widgets(&mut self) {
        self.timeline = None;
        self.widgets.clear();
        self.autosave = None;
    }
}

impl OverlaySink for CollectingSink {
    fn mount_timeline(&mut self, page: &mut Page, host: NodeId) -> Result<()> {
        page.append_html(host, "<nav class=\"chat-lens-timeline\"></nav>");
        self.timeline = Some(host);
        Ok(())
    }

    fn update_items(&mut self, items: Vec<MessageItem>) -> Result<()> {
        self.items = items;
        self.updates += 1;
        Ok(())
    }

    fn mount_widget(&mut self, page: &mut Page, host: NodeId, panel: &PanelMount) -> Result<()> {
        if self.fail_widgets {
            bail!("translation widget unavailable");
        }
        page.append_html(host, "<button class=\"chat-lens-translate\">Translate</button>");
        self.widgets.push(panel.locator.clone());
        Ok(())
    }

    fn inject_autosave(&mut self, page: &mut Page, host: NodeId, input: NodeId) -> Result<()> {
        page.append_html(host, "<span class=\"chat-lens-autosave\"></span>");
        self.autosave = Some(input);
        Ok(())
    }
}

pub struct Augmenter<S> {
    config: AugmentConfig,
    selectors: Selectors,
    sink: S,
    reconcile: ReconcileContext,
    panels: PanelWatcher,
    mounts: MountGuard,
    body_observer: Option<ObserverId>,
    autosave_input: Option<NodeId>,
}

impl<S: OverlaySink> Augmenter<S> {
    pub fn new(config: AugmentConfig, sink: S) -> Result<Self> {
        let selectors = config.compile().context("invalid selector configuration")?;
        Ok(Self {
            config,
            selectors,
            sink,
            reconcile: ReconcileContext::new(),
            panels: PanelWatcher::default(),
            mounts: MountGuard::default(),
            body_observer: None,
            autosave_input: None,
        })
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.config
    }

    pub fn selectors(&self) -> &Selectors {
        &self.selectors
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn reconcile(&self) -> &ReconcileContext {
        &self.reconcile
    }

    pub fn panels(&self) -> &PanelWatcher {
        &self.panels
    }

    pub fn mounts(&self) -> &MountGuard {
        &self.mounts
    }

    pub fn is_started(&self) -> bool {
        self.body_observer.is_some()
    }

    /// The editor the autosave probe last found.
    pub fn autosave_input(&self) -> Option<NodeId> {
        self.autosave_input
    }

    /// Source text of the pinned message selector.
    pub fn active_selector(&self) -> Option<&str> {
        self.reconcile
            .selector_state()
            .active()
            .and_then(|i| self.selectors.messages.get(i))
            .map(|c| c.source.as_str())
    }

    /// Readiness-gated startup. Returns false while the document is still
    /// loading; call again once it is interactive. Repeated calls are no-ops.
    pub fn start(&mut self, page: &mut Page) -> bool {
        if self.is_started() {
            return true;
        }
        if page.ready_state() == ReadyState::Loading {
            debug!("document still loading, deferring start");
            return false;
        }
        let Some(body) = page.body() else {
            warn!("document has no body, cannot start");
            return false;
        };

        let sink = &mut self.sink;
        let timeline = self.mounts.mount(
            page,
            MountKind::Timeline,
            body,
            Anchor::AppendTo(body),
            |page, host| sink.mount_timeline(page, host),
        );
        log_failure("timeline mount", timeline);

        self.global_pass(page, None);
        self.body_observer = Some(page.observe(body, ObserveOptions::subtree_children()));
        info!(
            items = self.reconcile.ids().len(),
            panels = self.panels.mounted_count(),
            "augmenter started"
        );
        true
    }

    /// Deliver queued mutation batches until the page is quiet. Returns the
    /// number of delivery rounds. Failures are logged and never stop delivery.
    pub fn pump(&mut self, page: &mut Page) -> usize {
        let mut rounds = 0;
        while page.has_pending_records() {
            if rounds == MAX_PUMP_ROUNDS {
                warn!(rounds = rounds, "page did not settle, deferring remaining batches");
                break;
            }
            rounds += 1;
            for (observer, records) in page.take_records() {
                if Some(observer) == self.body_observer {
                    self.global_pass(page, Some(&records));
                } else {
                    let result = self.panels.on_panel_batch(
                        page,
                        observer,
                        &self.selectors,
                        &mut self.mounts,
                        &mut self.sink,
                    );
                    log_failure("panel batch", result);
                }
            }
        }
        rounds
    }

    /// Stop observing and drop every subscription. Mounted widgets stay.
    pub fn stop(&mut self, page: &mut Page) {
        if let Some(observer) = self.body_observer.take() {
            page.disconnect(observer);
        }
        self.panels.clear(page);
    }

    /// Hash ids the last passes wrote into the page, for mirroring into a live
    /// tab.
    pub fn take_id_writes(&mut self) -> Vec<IdWrite> {
        self.reconcile.take_id_writes()
    }

    /// Forget the pinned selector (the page was navigated to a new session).
    pub fn reset_discovery(&mut self) {
        self.reconcile.reset_discovery();
    }

    /// Prepare for a fresh snapshot of the same session. Everything tied to the
    /// old document goes; the pinned selector stays.
    pub fn next_document(&mut self)
    where
        S: ResetSink,
    {
        self.reconcile.next_document();
        self.panels = PanelWatcher::default();
        self.mounts.clear();
        self.body_observer = None;
        self.autosave_input = None;
        self.sink.next_document();
    }

    /// `None` records means the initial manual scan.
    fn global_pass(&mut self, page: &mut Page, records: Option<&[MutationRecord]>) {
        let reconciled = self
            .reconcile
            .run(page, &self.selectors, &self.config, &mut self.sink);
        log_failure("reconcile", reconciled);

        let panels = match records {
            None => self
                .panels
                .scan(page, &self.selectors, &mut self.mounts, &mut self.sink),
            Some(records) => self.panels.on_added_nodes(
                page,
                records,
                &self.selectors,
                &mut self.mounts,
                &mut self.sink,
            ),
        };
        log_failure("panel dispatch", panels);

        let autosave = self.probe_autosave(page);
        log_failure("autosave probe", autosave);

        let swept = self.panels.sweep_detached(page);
        if swept > 0 {
            debug!(swept = swept, "dropped watchers for detached panels");
        }
        self.mounts.forget_detached(page);
        self.reconcile.prune(page);
    }

    /// One autosave indicator per document, attached once an editor shows up.
    fn probe_autosave(&mut self, page: &mut Page) -> Result<()> {
        let Some(input) = self
            .selectors
            .autosave_inputs
            .iter()
            .find_map(|c| page.query_document(&c.selector))
        else {
            return Ok(());
        };
        self.autosave_input = Some(input);

        let Some(body) = page.body() else {
            return Ok(());
        };
        let sink = &mut self.sink;
        let host = self.mounts.mount(
            page,
            MountKind::Autosave,
            body,
            Anchor::AppendTo(body),
            |page, host| sink.inject_autosave(page, host, input),
        )?;
        if host.is_some() {
            info!("autosave indicator attached");
        }
        Ok(())
    }
}

impl Augmenter<CollectingSink> {
    pub fn report(&self) -> ScanReport {
        self.sink.report(self.active_selector().map(str::to_string))
    }
}

/// Sinks that keep per-document widget state implement this so the
/// augmenter can move on to a new snapshot.
pub trait ResetSink {
    fn next_document(&mut self);
}

impl ResetSink for CollectingSink {
    fn next_document(&mut self) {
        self.clear_widgets();
    }
}

fn log_failure<T>(stage: &str, result: Result<T>) {
    if let Err(e) = result {
        error!(stage = stage, error = %format!("{e:#}"), "mutation handler failed");
    }
}
