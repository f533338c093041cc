//! Draft autosave: debounced writes of the editor's text, cleared shortly
//! after the user sends.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AutosaveConfig;

/// Key-value storage for draft text.
#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;
    async fn save(&self, key: &str, content: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Default draft file: `~/.chat-lens/drafts.json`
pub fn drafts_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chat-lens")
        .join("drafts.json")
}

/// Drafts kept as one JSON object on disk.
pub struct FileDraftStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    lock: tokio::sync::Mutex<()>,
}

impl Default for FileDraftStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileDraftStore {
    pub fn new() -> Self {
        Self::with_path(drafts_path())
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => serde_json::from_str(&json)
                .with_context(|| format!("Corrupt draft file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn write_all(&self, drafts: &BTreeMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(drafts)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

#[async_trait]
impl DraftStore for FileDraftStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn save(&self, key: &str, content: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut drafts = self.read_all().await?;
        drafts.insert(key.to_string(), content.to_string());
        self.write_all(&drafts).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut drafts = self.read_all().await?;
        if drafts.remove(key).is_some() {
            self.write_all(&drafts).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDraftStore {
    drafts: Mutex<BTreeMap<String, String>>,
}

impl MemoryDraftStore {
    pub fn get(&self, key: &str) -> Option<String> {
        self.drafts
            .lock()
            .ok()
            .and_then(|d| d.get(key).cloned())
    }
}

#[async_trait]
impl DraftStore for MemoryDraftStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, content: &str) -> Result<()> {
        let mut drafts = self
            .drafts
            .lock()
            .map_err(|_| anyhow::anyhow!("draft store poisoned"))?;
        drafts.insert(key.to_string(), content.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut drafts = self
            .drafts
            .lock()
            .map_err(|_| anyhow::anyhow!("draft store poisoned"))?;
        drafts.remove(key);
        Ok(())
    }
}

/// Debounces editor input into the draft store. Must be used from inside a
/// tokio runtime.
pub struct DraftAutosaver {
    store: Arc<dyn DraftStore>,
    key: String,
    debounce: Duration,
    grace: Duration,
    pending: Option<JoinHandle<()>>,
    clearing: Option<JoinHandle<()>>,
}

impl DraftAutosaver {
    pub fn new(store: Arc<dyn DraftStore>, config: &AutosaveConfig) -> Self {
        Self {
            store,
            key: config.draft_key.clone(),
            debounce: Duration::from_millis(config.debounce_ms),
            grace: Duration::from_millis(config.clear_grace_ms),
            pending: None,
            clearing: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a debounced save is still waiting to commit.
    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Restart the debounce window with `text`. Blank text cancels the pending
    /// save and is never written. Returns whether a save was scheduled.
    pub fn on_input(&mut self, text: &str) -> bool {
        self.cancel_pending();
        if text.trim().is_empty() {
            return false;
        }
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let content = text.to_string();
        let debounce = self.debounce;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            match store.save(&key, &content).await {
                Ok(()) => debug!(chars = content.chars().count(), "draft saved"),
                Err(e) => warn!(error = %format!("{e:#}"), "draft save failed"),
            }
        }));
        true
    }

    /// Enter without Shift is a send: drop the pending save and clear the
    /// stored draft after the grace delay, leaving the host's own submit
    /// handling to run first. Returns whether a clear was scheduled.
    pub fn on_keydown(&mut self, key: &str, shift: bool) -> bool {
        if key != "Enter" || shift {
            return false;
        }
        self.cancel_pending();
        if let Some(previous) = self.clearing.take() {
            previous.abort();
        }
        let store = Arc::clone(&self.store);
        let draft_key = self.key.clone();
        let grace = self.grace;
        self.clearing = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match store.remove(&draft_key).await {
                Ok(()) => debug!("draft cleared after send"),
                Err(e) => warn!(error = %format!("{e:#}"), "draft clear failed"),
            }
        }));
        true
    }

    /// The saved draft, if any, for offering restoration.
    pub async fn restore(&self) -> Result<Option<String>> {
        self.store
            .load(&self.key)
            .await
            .context("Failed to read saved draft")
    }

    /// The saved draft, offered only while the editor is empty so a restore
    /// never overwrites what the user is typing.
    pub async fn offer(&self, editor_text: &str) -> Result<Option<String>> {
        if !editor_text.trim().is_empty() {
            return Ok(None);
        }
        Ok(self.restore().await?.filter(|draft| !draft.trim().is_empty()))
    }

    /// Wait for scheduled saves and clears to finish.
    pub async fn flush(&mut self) {
        for handle in [self.pending.take(), self.clearing.take()].into_iter().flatten() {
            let _ = handle.await;
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for DraftAutosaver {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
