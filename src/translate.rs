//! Batch translation of a panel's visible text.
//!
//! The widget collects the content region's text nodes, sends their texts as
//! one ordered batch, and writes results back only when the response lines up
//! one-to-one with the request. Anything else leaves the page untouched.

use async_trait::async_trait;
use ego_tree::NodeId;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Selectors, TranslateConfig};
use crate::dom::Page;
use crate::panel::PanelLocator;

/// Text under these elements is never translated.
const UNTRANSLATED_TAGS: &[&str] = &["code", "pre"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub texts: Vec<String>,
}

/// Backend reply: either one translation per input, in order, or an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TranslateResponse {
    Translated {
        #[serde(rename = "translatedTexts")]
        translated_texts: Vec<String>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("translation backend error: {0}")]
    Backend(String),

    #[error("translation returned {actual} texts for {expected} inputs")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("panel content not found for #{0}")]
    ContentMissing(String),

    #[error("translation request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, request: &TranslateRequest) -> TranslateResponse;
}

/// Translator backed by the public `client=gtx` endpoint, one request per
/// non-blank entry, issued concurrently.
pub struct GtxTranslator {
    client: reqwest::Client,
    endpoint: String,
    target_language: String,
}

impl GtxTranslator {
    pub fn new(config: &TranslateConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            target_language: config.target_language.clone(),
        }
    }

    pub async fn translate_all(&self, texts: &[String]) -> Result<Vec<String>, TranslateError> {
        try_join_all(texts.iter().map(|text| self.translate_one(text))).await
    }

    async fn translate_one(&self, text: &str) -> Result<String, TranslateError> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        let url = format!("{}/translate_a/single", self.endpoint);
        let data: Value = self
            .client
            .get(&url)
            .query(&[
                ("client", "gtx"),
                ("sl", "auto"),
                ("tl", self.target_language.as_str()),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // [[["translated", "source", ...], ...], ...]: long inputs come back split.
        let Some(segments) = data.get(0).and_then(Value::as_array) else {
            debug!("translation response had no segments, keeping source");
            return Ok(text.to_string());
        };
        Ok(segments
            .iter()
            .filter_map(|s| s.get(0).and_then(Value::as_str))
            .collect())
    }
}

#[async_trait]
impl Translator for GtxTranslator {
    async fn translate(&self, request: &TranslateRequest) -> TranslateResponse {
        match self.translate_all(&request.texts).await {
            Ok(translated_texts) => TranslateResponse::Translated { translated_texts },
            Err(e) => TranslateResponse::Failed {
                error: e.to_string(),
            },
        }
    }
}

/// Text nodes under `content` worth translating, in document order. Skips
/// whitespace-only nodes and anything inside code or pre blocks.
pub fn collect_text_nodes(page: &Page, content: NodeId) -> Vec<NodeId> {
    page.text_nodes(content)
        .into_iter()
        .filter(|&node| !page.text_content(node).trim().is_empty())
        .filter(|&node| !inside_untranslated(page, content, node))
        .collect()
}

fn inside_untranslated(page: &Page, content: NodeId, node: NodeId) -> bool {
    let mut current = page.parent(node);
    while let Some(id) = current {
        if page
            .tag_name(id)
            .is_some_and(|tag| UNTRANSLATED_TAGS.contains(&tag))
        {
            return true;
        }
        if id == content {
            break;
        }
        current = page.parent(id);
    }
    false
}

/// Write translations back. The response is validated in full before the
/// first node is touched. Returns the number of nodes rewritten.
pub fn apply_translation(
    page: &mut Page,
    nodes: &[NodeId],
    response: TranslateResponse,
) -> Result<usize, TranslateError> {
    let texts = match response {
        TranslateResponse::Failed { error } => return Err(TranslateError::Backend(error)),
        TranslateResponse::Translated { translated_texts } => translated_texts,
    };
    if texts.len() != nodes.len() {
        return Err(TranslateError::LengthMismatch {
            expected: nodes.len(),
            actual: texts.len(),
        });
    }
    let mut written = 0;
    for (node, text) in nodes.iter().zip(&texts) {
        if page.set_text_node(*node, text) {
            written += 1;
        }
    }
    Ok(written)
}

/// Translate a mounted panel in place. Content is located through the
/// locator at call time, since the panel may have re-rendered since mount.
pub async fn translate_panel(
    page: &mut Page,
    locator: &PanelLocator,
    selectors: &Selectors,
    translator: &dyn Translator,
) -> Result<usize, TranslateError> {
    let content = locator
        .resolve_content(page, selectors)
        .ok_or_else(|| TranslateError::ContentMissing(locator.root_id.clone()))?;
    let nodes = collect_text_nodes(page, content);
    if nodes.is_empty() {
        return Ok(0);
    }
    let request = TranslateRequest {
        texts: nodes.iter().map(|&n| page.text_content(n)).collect(),
    };
    let response = translator.translate(&request).await;
    apply_translation(page, &nodes, response).inspect_err(|e| {
        warn!(locator = %locator.root_id, error = %e, "translation not applied");
    })
}
