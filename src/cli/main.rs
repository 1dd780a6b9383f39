use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tagline::ai::GeminiServiceFactory;
use tagline::config::{PromptSlot, Settings, SettingsStore, MODEL_OPTIONS};
use tagline::credentials::{AddOutcome, CredentialStore};
use tagline::pipeline::{collect_images, Processor, WorkItem};
use tagline::queue::ProcessingQueue;
use tagline::status::{ItemStatus, QueueEvent, StatusTracker};

#[derive(Parser, Debug)]
#[command(
    name = "tagline",
    version,
    about = "Batch AI image captioning and keyword tagging — embeds the results as image metadata"
)]
struct Cli {
    /// Image files or directories to process
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Directory holding the encrypted settings (default: next to the binary)
    #[arg(short, long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Write a default settings file and exit
    #[arg(long)]
    init: bool,

    /// Add an API key (persisted, becomes the current key)
    #[arg(long, value_name = "KEY")]
    add_key: Option<String>,

    /// Select the current API key by index (persisted)
    #[arg(long, value_name = "INDEX")]
    use_key: Option<usize>,

    /// Remove an API key by index (persisted)
    #[arg(long, value_name = "INDEX")]
    remove_key: Option<usize>,

    /// List stored API keys (redacted) and exit
    #[arg(long)]
    list_keys: bool,

    /// Model identifier override for this run
    #[arg(short, long)]
    model: Option<String>,

    /// Retry budget override for this run
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Requested keyword count override for this run
    #[arg(long, value_name = "N")]
    hashtags: Option<usize>,

    /// Inter-attempt delay override in seconds, fractional allowed
    #[arg(long, value_name = "SECS")]
    delay: Option<f64>,

    /// Also write a .txt sidecar next to each image
    #[arg(long)]
    txt: bool,

    /// Use the prompt-template combination saved in slot N for this run
    #[arg(long, value_name = "N")]
    prompt_slot: Option<usize>,

    /// Save the effective prompt templates into slot N (persisted) and exit
    #[arg(long, value_name = "N")]
    save_prompt_slot: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let config_dir = match cli.config_dir {
        Some(ref dir) => dir.clone(),
        None => SettingsStore::default_dir()?,
    };
    let store = SettingsStore::new(&config_dir);

    if cli.init {
        store.save(&Settings::default())?;
        println!("Default settings written to {}", store.settings_path().display());
        return Ok(());
    }

    let mut settings = store.load();

    if manage_keys(&cli, &mut settings, &store)? {
        return Ok(());
    }

    // per-run overrides, not persisted
    if let Some(model) = cli.model {
        if !MODEL_OPTIONS.contains(&model.as_str()) {
            log::warn!("model {model} is not in the known set {MODEL_OPTIONS:?}");
        }
        settings.selected_model = model;
    }
    if let Some(retries) = cli.retries {
        settings.retry_count = retries.max(1);
    }
    if let Some(hashtags) = cli.hashtags {
        settings.num_hashtags = hashtags;
    }
    if let Some(delay) = cli.delay {
        settings.delay_seconds = delay.max(0.0);
    }
    if cli.txt {
        settings.save_txt = true;
    }
    if let Some(index) = cli.prompt_slot {
        match settings.prompt_slot(index)?.cloned() {
            Some(slot) => {
                settings.caption_prompt = slot.caption_prompt;
                settings.tags_prompt = slot.tags_prompt;
                settings.num_hashtags = slot.num_hashtags;
            }
            None => anyhow::bail!("prompt slot {index} is empty"),
        }
    }
    if let Some(index) = cli.save_prompt_slot {
        let slot = PromptSlot {
            caption_prompt: settings.caption_prompt.clone(),
            tags_prompt: settings.tags_prompt.clone(),
            num_hashtags: settings.num_hashtags,
        };
        settings.save_prompt_slot(index, slot)?;
        store.save(&settings)?;
        println!("Prompt combination saved to slot {index}");
        return Ok(());
    }

    if cli.paths.is_empty() {
        anyhow::bail!("No input files or directories specified. Use --help for usage.");
    }
    if settings.api_keys.is_empty() {
        anyhow::bail!(
            "No API keys configured. Add one with `tagline --add-key <KEY>` first."
        );
    }

    let images = collect_images(&cli.paths);
    if images.is_empty() {
        anyhow::bail!("No supported image files found in the specified paths.");
    }
    let total = images.len();
    log::info!("Found {total} image(s) to process with {}", settings.selected_model);

    let settings = Arc::new(settings);
    let tracker = StatusTracker::new();
    let processor = Arc::new(Processor::new(
        settings.clone(),
        Box::new(GeminiServiceFactory),
        tracker.clone(),
    ));
    let queue = ProcessingQueue::new(processor.clone(), tracker.clone(), settings.concurrency);

    // render core events as progress lines
    let mut events = tracker.subscribe();
    let printer = tokio::spawn(async move {
        let mut done = 0usize;
        while let Ok(event) = events.recv().await {
            match event {
                QueueEvent::StatusChanged { path, status } => match status {
                    ItemStatus::Success => {
                        done += 1;
                        log::info!("[{done}/{total}] done: {}", path.display());
                    }
                    ItemStatus::Failed => {
                        done += 1;
                        log::error!("[{done}/{total}] failed: {}", path.display());
                    }
                    ItemStatus::WaitingRetry => {
                        log::info!("waiting to retry: {}", path.display());
                    }
                    ItemStatus::Pending => {}
                },
                QueueEvent::Log(line) => log::info!("{line}"),
                QueueEvent::QueueChanged => {}
            }
        }
    });

    queue.start();
    for path in images {
        queue.enqueue(WorkItem::new(path, settings.selected_model.clone()));
    }
    queue.wait_for_idle().await;
    printer.abort();

    // persist the credential pointer in case rotation moved it
    let final_index = processor.credentials().lock().unwrap().current();
    if final_index != settings.current_key_index {
        let mut updated = (*settings).clone();
        updated.current_key_index = final_index;
        if let Err(e) = store.save(&updated) {
            log::warn!("could not persist rotated credential index: {e:#}");
        }
    }

    let records = tracker.snapshot();
    let succeeded = records
        .iter()
        .filter(|r| r.status == ItemStatus::Success)
        .count();
    let failed = records
        .iter()
        .filter(|r| r.status == ItemStatus::Failed)
        .count();
    let skipped = total - records.len().min(total);
    log::info!("Done: {succeeded} succeeded, {failed} failed out of {total} images");
    if skipped > 0 {
        log::info!("{skipped} duplicate path(s) skipped");
    }

    if succeeded == 0 && failed > 0 {
        anyhow::bail!("all images failed");
    }
    Ok(())
}

/// Apply key-management flags. Returns `true` when the invocation was purely
/// key management and processing should not run.
fn manage_keys(cli: &Cli, settings: &mut Settings, store: &SettingsStore) -> Result<bool> {
    let mut managed = false;

    if let Some(ref key) = cli.add_key {
        let mut credentials = CredentialStore::new(
            settings.api_keys.clone(),
            settings.current_key_index,
        );
        match credentials.add(key.clone()) {
            AddOutcome::Added(index) => {
                settings.api_keys = credentials.tokens().to_vec();
                settings.current_key_index = Some(index);
                store.save(settings)?;
                println!("API key added at index {index} and set as current");
            }
            AddOutcome::Duplicate => println!("API key already stored"),
        }
        managed = true;
    }

    if let Some(index) = cli.use_key {
        let mut credentials = CredentialStore::new(
            settings.api_keys.clone(),
            settings.current_key_index,
        );
        credentials
            .set_current(index)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        settings.current_key_index = Some(index);
        store.save(settings)?;
        println!("Current API key set to index {index}");
        managed = true;
    }

    if let Some(index) = cli.remove_key {
        let mut credentials = CredentialStore::new(
            settings.api_keys.clone(),
            settings.current_key_index,
        );
        if credentials.remove(index).is_none() {
            anyhow::bail!("no API key at index {index}");
        }
        settings.api_keys = credentials.tokens().to_vec();
        settings.current_key_index = credentials.current();
        store.save(settings)?;
        println!("API key {index} removed");
        managed = true;
    }

    if cli.list_keys {
        if settings.api_keys.is_empty() {
            println!("No API keys stored");
        }
        for (i, key) in settings.api_keys.iter().enumerate() {
            let marker = if settings.current_key_index == Some(i) {
                "*"
            } else {
                " "
            };
            println!("{marker} [{i}] {}", redact(key));
        }
        managed = true;
    }

    // key management without paths is a complete invocation
    Ok(managed && cli.paths.is_empty())
}

/// Show just enough of a key to recognize it.
fn redact(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}…{tail}")
    }
}
