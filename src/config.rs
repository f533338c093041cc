//! Engine configuration: selector candidates and timing knobs.
//!
//! Defaults describe the chat application this tool was built for. A JSON file
//! passed with `--config` can override any subset of fields.

use std::path::Path;

use anyhow::{Context, Result};
use scraper::Selector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Candidate message containers, highest priority first. The last entry is
    /// the catch-all fallback.
    pub containers: Vec<String>,
    /// Candidate "user message" selectors, most specific first.
    pub message_selectors: Vec<String>,
    /// Preferred content sub-elements inside a message; the message itself is
    /// the final fallback.
    pub message_content: Vec<String>,
    pub summary_chars: usize,
    /// Native ids of this length or shorter are considered too generic to reuse.
    pub native_id_min_len: usize,
    pub panel: PanelConfig,
    pub autosave: AutosaveConfig,
    pub translate: TranslateConfig,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            containers: strings(&[
                "main",
                "#chat-history-container",
                "div[class*=\"chat-history\"]",
                "body",
            ]),
            message_selectors: strings(&[
                ".user-query-bubble-with-background",
                ".user-query-bubble-container",
                ".user-query-container",
                ".query-text-line",
                "user-query-content .user-query-bubble-with-background",
                "div[aria-label=\"User message\"]",
                "article[data-author=\"user\"]",
                "article[data-turn=\"user\"]",
                "[data-message-author-role=\"user\"]",
                "div[role=\"listitem\"][data-user=\"true\"]",
                ".user-query",
                "div[data-message-id]",
            ]),
            message_content: strings(&[".user-query-content", "p"]),
            summary_chars: 20,
            native_id_min_len: 5,
            panel: PanelConfig::default(),
            autosave: AutosaveConfig::default(),
            translate: TranslateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub root: String,
    pub triggers: Vec<String>,
    /// Content region markers; the trigger's next element sibling is the last resort.
    pub content: Vec<String>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            root: "model-thoughts".into(),
            triggers: strings(&[
                "button[data-test-id=\"thoughts-header-button\"]",
                "button[aria-label*=\"thoughts\"]",
                "button[aria-label*=\"思路\"]",
                ".mat-expansion-panel-header",
            ]),
            content: strings(&[
                "div[data-test-id=\"thoughts-content\"]",
                ".mat-expansion-panel-body",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    pub inputs: Vec<String>,
    pub draft_key: String,
    pub debounce_ms: u64,
    pub clear_grace_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            inputs: strings(&[
                "div.rich-textarea > div[contenteditable=\"true\"]",
                "div[contenteditable=\"true\"][role=\"textbox\"]",
                ".ql-editor",
            ]),
            draft_key: "draft_content".into(),
            debounce_ms: 1000,
            clear_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    pub endpoint: String,
    pub target_language: String,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://translate.googleapis.com".into(),
            target_language: "zh-CN".into(),
        }
    }
}

impl AugmentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Load from `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Parse every selector once so reconciliation passes never re-parse.
    pub fn compile(&self) -> Result<Selectors> {
        if self.containers.is_empty() {
            anyhow::bail!("at least one container selector is required");
        }
        Ok(Selectors {
            containers: SelectorList::compile(&self.containers).context("containers")?,
            messages: SelectorList::compile(&self.message_selectors)
                .context("message_selectors")?,
            message_content: SelectorList::compile(&self.message_content)
                .context("message_content")?,
            panel_root: SelectorList::compile(std::slice::from_ref(&self.panel.root))
                .context("panel.root")?,
            panel_triggers: SelectorList::compile(&self.panel.triggers)
                .context("panel.triggers")?,
            panel_content: SelectorList::compile(&self.panel.content).context("panel.content")?,
            autosave_inputs: SelectorList::compile(&self.autosave.inputs)
                .context("autosave.inputs")?,
        })
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// A parsed selector that remembers its source text (for logs and reports).
#[derive(Debug, Clone)]
pub struct CandidateSelector {
    pub source: String,
    pub selector: Selector,
}

/// Ordered, pre-parsed selector candidates.
#[derive(Debug, Clone, Default)]
pub struct SelectorList(Vec<CandidateSelector>);

impl SelectorList {
    pub fn compile(sources: &[String]) -> Result<Self> {
        sources
            .iter()
            .map(|source| {
                Selector::parse(source)
                    .map(|selector| CandidateSelector {
                        source: source.clone(),
                        selector,
                    })
                    .map_err(|e| anyhow::anyhow!("invalid selector {source:?}: {e}"))
            })
            .collect::<Result<Vec<_>>>()
            .map(SelectorList)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CandidateSelector> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&CandidateSelector> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Every selector the engine uses, compiled.
#[derive(Debug, Clone)]
pub struct Selectors {
    pub containers: SelectorList,
    pub messages: SelectorList,
    pub message_content: SelectorList,
    pub panel_root: SelectorList,
    pub panel_triggers: SelectorList,
    pub panel_content: SelectorList,
    pub autosave_inputs: SelectorList,
}
