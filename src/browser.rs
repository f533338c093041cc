use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tracing::{debug, info};

use crate::mutation::{self, DirtyState};
use crate::pipeline::IdWrite;

/// Connect to an already-running Chrome instance via CDP.
///
/// Chrome must be started with `--remote-debugging-port=<port>`, e.g.:
///   google-chrome --remote-debugging-port=9222
pub async fn connect(port: u16) -> Result<Browser> {
    let url = format!("http://127.0.0.1:{port}");
    info!(port = port, "connecting to Chrome via CDP");
    let (browser, mut handler) = Browser::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to Chrome on port {port}. Is Chrome running with --remote-debugging-port={port}?"))?;

    tokio::spawn(async move { while handler.next().await.is_some() {} });

    info!(port = port, "connected to Chrome");
    Ok(browser)
}

/// Launch a new Chrome instance. The chat app needs a signed-in profile, so
/// `headless` is usually false.
pub async fn launch(headless: bool) -> Result<Browser> {
    info!(headless = headless, "launching Chrome");
    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .arg("--disable-gpu")
        .arg("--disable-dev-shm-usage");
    if !headless {
        builder = builder.with_head();
    }
    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("Failed to launch Chrome. Is Chrome/Chromium installed?")?;

    tokio::spawn(async move { while handler.next().await.is_some() {} });

    info!("Chrome launched");
    Ok(browser)
}

/// Open `url` in a new tab and wait for the first navigation to settle.
pub async fn open_page(browser: &Browser, url: &str) -> Result<Page> {
    debug!(url = %url, "opening page");
    let page = browser
        .new_page(url)
        .await
        .with_context(|| format!("Failed to navigate to {url}"))?;
    page.wait_for_navigation().await.ok();
    Ok(page)
}

/// Rendered HTML plus the page's current URL (falling back to `fallback_url`).
pub async fn snapshot(page: &Page, fallback_url: &str) -> Result<(String, String)> {
    let html = page.content().await.context("Failed to get page content")?;
    let url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| fallback_url.to_string());
    debug!(url = %url, html_len = html.len(), "page snapshot");
    Ok((html, url))
}

/// Evaluate a script that returns a string. Failures read as an empty string;
/// the page may be mid-navigation.
pub async fn evaluate_string(page: &Page, js: &str) -> String {
    page.evaluate(js)
        .await
        .ok()
        .and_then(|v| v.into_value::<String>().ok())
        .unwrap_or_default()
}

pub async fn install_observer(page: &Page) {
    page.evaluate(mutation::INSTALL_OBSERVER_JS).await.ok();
}

pub async fn poll_dirty(page: &Page) -> DirtyState {
    DirtyState::from_json(&evaluate_string(page, mutation::CHECK_DIRTY_JS).await)
}

/// Clear the dirty flag. Re-installs the observer when the page navigated and
/// lost it.
pub async fn reset_dirty(page: &Page) {
    let installed = page
        .evaluate("typeof window.__chat_lens_observer === 'object'")
        .await
        .ok()
        .and_then(|v| v.into_value::<bool>().ok())
        .unwrap_or(false);
    if installed {
        page.evaluate(mutation::RESET_DIRTY_JS).await.ok();
    } else {
        install_observer(page).await;
    }
}

/// Script returning the `innerText` of the first editor matching any of
/// `selectors`, or an empty string.
pub fn editor_text_js(selectors: &[String]) -> String {
    let list = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(function() {{
    var selectors = {list};
    for (var i = 0; i < selectors.length; i++) {{
        var el = document.querySelector(selectors[i]);
        if (el) return el.innerText || '';
    }}
    return '';
}})()"#
    )
}

/// Script that writes `draft` into the first matching editor, but only while
/// that editor is empty, then fires `input` so the page's framework notices.
/// Returns whether the draft was written.
pub fn restore_draft_js(selectors: &[String], draft: &str) -> String {
    let list = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".into());
    let draft = serde_json::to_string(draft).unwrap_or_else(|_| "\"\"".into());
    format!(
        r#"(function() {{
    var selectors = {list}, draft = {draft};
    for (var i = 0; i < selectors.length; i++) {{
        var el = document.querySelector(selectors[i]);
        if (!el) continue;
        if ((el.innerText || '').trim()) return false;
        el.innerText = draft;
        el.dispatchEvent(new Event('input', {{ bubbles: true }}));
        el.focus();
        return true;
    }}
    return false;
}})()"#
    )
}

pub async fn restore_draft(page: &Page, js: &str) -> bool {
    page.evaluate(js)
        .await
        .ok()
        .and_then(|v| v.into_value::<bool>().ok())
        .unwrap_or(false)
}

/// Script that gives live messages the ids a snapshot assigned them. It
/// re-resolves the container and top-level matches of `selector`, and only
/// touches an element that still has no id and whose text is unchanged.
/// Returns the number of ids written.
pub fn assign_ids_js(
    containers: &[String],
    selector: &str,
    content: &[String],
    writes: &[IdWrite],
) -> String {
    let containers = serde_json::to_string(containers).unwrap_or_else(|_| "[]".into());
    let selector = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".into());
    let content = serde_json::to_string(content).unwrap_or_else(|_| "[]".into());
    let writes = serde_json::to_string(writes).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(function() {{
    var containers = {containers}, selector = {selector}, content = {content}, writes = {writes};
    var container = null;
    for (var i = 0; i < containers.length && !container; i++) {{
        var c = document.querySelector(containers[i]);
        if (c && c.querySelector(selector)) container = c;
    }}
    if (!container) return 0;
    var all = Array.prototype.slice.call(container.querySelectorAll(selector));
    var top = all.filter(function(el) {{
        return !all.some(function(o) {{ return o !== el && o.contains(el); }});
    }});
    var written = 0;
    writes.forEach(function(w) {{
        var el = top[w.index];
        if (!el || el.id) return;
        var target = el;
        for (var j = 0; j < content.length; j++) {{
            var found = el.querySelector(content[j]);
            if (found) {{ target = found; break; }}
        }}
        if ((target.textContent || '').normalize().trim() !== w.text) return;
        el.id = w.id;
        written++;
    }});
    return written;
}})()"#
    )
}

/// Mirror snapshot-assigned ids into the tab. Failures count as zero writes.
pub async fn assign_ids(page: &Page, js: &str) -> u64 {
    page.evaluate(js)
        .await
        .ok()
        .and_then(|v| v.into_value::<u64>().ok())
        .unwrap_or(0)
}
