use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use chat_lens::augmenter::{Augmenter, CollectingSink, ScanReport};
use chat_lens::autosave::{DraftAutosaver, DraftStore, FileDraftStore};
use chat_lens::config::AugmentConfig;
use chat_lens::diff::{diff_items, format_diff};
use chat_lens::dom::{MessageItem, Page};
use chat_lens::translate::{translate_panel, GtxTranslator, TranslateRequest, Translator};
use chat_lens::{browser, serialize};

#[derive(Parser)]
#[command(name = "chat-lens")]
#[command(about = "Keeps a message timeline, panel widgets and draft autosave anchored to a live chat page")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery and reconciliation over an HTML file or stdin
    Scan {
        /// HTML file path, or '-' for stdin
        input: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// JSON config overriding the default selectors
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Follow a live chat tab over CDP, printing timeline changes and autosaving drafts
    Watch {
        /// Chat page URL to open
        url: String,

        /// Chrome debugging port to connect to
        #[arg(short, long, default_value_t = 9222)]
        port: u16,

        /// Launch a new Chrome instead of connecting
        #[arg(short, long)]
        launch: bool,

        /// Launch headless (only with --launch)
        #[arg(long)]
        headless: bool,

        /// Poll interval for the page's dirty flag
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,

        /// Draft file (defaults to ~/.chat-lens/drafts.json)
        #[arg(long)]
        store: Option<PathBuf>,

        /// Leave an empty editor empty instead of restoring the saved draft
        #[arg(long)]
        no_restore: bool,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Translate texts in one batch, or every thoughts panel of an HTML file
    Translate {
        /// Texts to translate (ignored with --html)
        texts: Vec<String>,

        /// HTML file whose thoughts panels are translated in place and printed
        #[arg(long)]
        html: Option<PathBuf>,

        /// Target language, e.g. zh-CN
        #[arg(short, long)]
        target: Option<String>,

        /// Translation endpoint base URL
        #[arg(long)]
        endpoint: Option<String>,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Inspect or clear the saved draft
    Draft {
        #[command(subcommand)]
        action: DraftAction,

        /// Draft file (defaults to ~/.chat-lens/drafts.json)
        #[arg(long, global = true)]
        store: Option<PathBuf>,

        #[arg(short, long, global = true)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum DraftAction {
    /// Print the saved draft
    Show,
    /// Delete the saved draft
    Clear,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            input,
            format,
            config,
        } => {
            info!(input = %input, format = %format, "scan command");
            let config = AugmentConfig::load_or_default(config.as_deref())?;
            run_scan(&input, &format, config)
        }
        Commands::Watch {
            url,
            port,
            launch,
            headless,
            interval_ms,
            store,
            no_restore,
            config,
        } => {
            info!(url = %url, port = port, launch = launch, "watch command");
            let config = AugmentConfig::load_or_default(config.as_deref())?;
            let options = WatchOptions {
                port,
                launch,
                headless,
                interval: Duration::from_millis(interval_ms),
                store: store_for(store),
                restore: !no_restore,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_watch(&url, config, options))
        }
        Commands::Translate {
            texts,
            html,
            target,
            endpoint,
            config,
        } => {
            let mut config = AugmentConfig::load_or_default(config.as_deref())?;
            if let Some(target) = target {
                config.translate.target_language = target;
            }
            if let Some(endpoint) = endpoint {
                config.translate.endpoint = endpoint;
            }
            let rt = tokio::runtime::Runtime::new()?;
            match html {
                Some(path) => rt.block_on(run_translate_html(&path, config)),
                None => rt.block_on(run_translate_texts(texts, config)),
            }
        }
        Commands::Draft {
            action,
            store,
            config,
        } => {
            let config = AugmentConfig::load_or_default(config.as_deref())?;
            let store = store_for(store);
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_draft(action, store, &config.autosave.draft_key))
        }
    }
}

fn store_for(path: Option<PathBuf>) -> FileDraftStore {
    match path {
        Some(path) => FileDraftStore::with_path(path),
        None => FileDraftStore::new(),
    }
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {input}"))
    }
}

fn run_scan(input: &str, format: &str, config: AugmentConfig) -> Result<()> {
    let html = read_input(input)?;
    let mut page = Page::parse(&html);
    let mut augmenter = Augmenter::new(config, CollectingSink::default())?;
    augmenter.start(&mut page);
    augmenter.pump(&mut page);

    let mut report = augmenter.report();
    if input != "-" {
        report.url = Some(input.to_string());
    }
    info!(items = report.items.len(), panels = report.panels.len(), "scan complete");
    print_report(&report, format)
}

fn print_report(report: &ScanReport, format: &str) -> Result<()> {
    let output = match format {
        "json" => serde_json::to_string_pretty(report)?,
        _ => serialize::to_compact_text(report),
    };
    println!("{output}");
    Ok(())
}

struct WatchOptions {
    port: u16,
    launch: bool,
    headless: bool,
    interval: Duration,
    store: FileDraftStore,
    restore: bool,
}

async fn run_watch(url: &str, config: AugmentConfig, options: WatchOptions) -> Result<()> {
    let browser = if options.launch {
        browser::launch(options.headless).await?
    } else {
        browser::connect(options.port).await?
    };
    let tab = browser::open_page(&browser, url).await?;
    browser::install_observer(&tab).await;

    let editor_js = browser::editor_text_js(&config.autosave.inputs);
    let mut autosaver = DraftAutosaver::new(Arc::new(options.store), &config.autosave);
    let mut restore_pending = options.restore;

    let mut augmenter = Augmenter::new(config, CollectingSink::default())?;
    let mut previous: Vec<MessageItem> = Vec::new();
    let mut last_url = String::new();
    let mut last_editor = String::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping watch");
                break;
            }
            _ = tokio::time::sleep(options.interval) => {}
        }

        let state = browser::poll_dirty(&tab).await;
        if state.send_intent {
            autosaver.on_keydown("Enter", false);
            last_editor.clear();
        }
        if !state.dirty {
            continue;
        }
        debug!(mutations = state.mutation_count, "page dirty, re-scanning");

        let (html, current_url) = browser::snapshot(&tab, url).await?;
        browser::reset_dirty(&tab).await;
        if current_url != last_url {
            if !last_url.is_empty() {
                info!(url = %current_url, "navigated, rediscovering message selector");
                augmenter.reset_discovery();
            }
            last_url = current_url;
        }

        let items = {
            let mut page = Page::parse(&html);
            augmenter.next_document();
            augmenter.start(&mut page);
            augmenter.pump(&mut page);
            augmenter.sink().items().to_vec()
        };
        let writes = augmenter.take_id_writes();
        // Without these the next snapshot would rehash edited messages.
        match augmenter.active_selector() {
            Some(selector) if !writes.is_empty() => {
                let js = browser::assign_ids_js(
                    &augmenter.config().containers,
                    selector,
                    &augmenter.config().message_content,
                    &writes,
                );
                let written = browser::assign_ids(&tab, &js).await;
                debug!(pending = writes.len(), written = written, "mirrored ids into the tab");
            }
            _ => {}
        }

        let diff = diff_items(&previous, &items);
        if !diff.is_empty() {
            print!("{}", format_diff(&diff));
        }
        previous = items;

        if restore_pending && augmenter.autosave_input().is_some() {
            restore_pending = false;
            let current = browser::evaluate_string(&tab, &editor_js).await;
            match autosaver.offer(&current).await {
                Ok(Some(draft)) => {
                    let inputs = &augmenter.config().autosave.inputs;
                    let js = browser::restore_draft_js(inputs, &draft);
                    if browser::restore_draft(&tab, &js).await {
                        info!(chars = draft.chars().count(), "restored saved draft");
                        last_editor = draft;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %format!("{e:#}"), "could not read saved draft"),
            }
        }

        if !state.send_intent && augmenter.autosave_input().is_some() {
            let text = browser::evaluate_string(&tab, &editor_js).await;
            if text != last_editor {
                autosaver.on_input(&text);
                last_editor = text;
            }
        }
    }

    autosaver.flush().await;
    Ok(())
}

async fn run_translate_texts(texts: Vec<String>, config: AugmentConfig) -> Result<()> {
    let translator = GtxTranslator::new(&config.translate);
    let response = translator.translate(&TranslateRequest { texts }).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_translate_html(path: &Path, config: AugmentConfig) -> Result<()> {
    let html = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let translator = GtxTranslator::new(&config.translate);
    let mut page = Page::parse(&html);
    let mut augmenter = Augmenter::new(config, CollectingSink::default())?;
    augmenter.start(&mut page);
    augmenter.pump(&mut page);

    let selectors = augmenter.selectors().clone();
    for locator in augmenter.sink().widgets().to_vec() {
        match translate_panel(&mut page, &locator, &selectors, &translator).await {
            Ok(count) => info!(panel = %locator.root_id, nodes = count, "panel translated"),
            Err(e) => warn!(panel = %locator.root_id, error = %e, "panel left untranslated"),
        }
    }
    println!("{}", page.html());
    Ok(())
}

async fn run_draft(action: DraftAction, store: FileDraftStore, key: &str) -> Result<()> {
    match action {
        DraftAction::Show => match store.load(key).await? {
            Some(draft) => println!("{draft}"),
            None => info!(path = %store.path().display(), "no saved draft"),
        },
        DraftAction::Clear => {
            store.remove(key).await?;
            info!(path = %store.path().display(), "draft cleared");
        }
    }
    Ok(())
}
