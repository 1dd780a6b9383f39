use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use walkdir::WalkDir;

use crate::ai::{AiError, CompletionService, ServiceFactory};
use crate::config::Settings;
use crate::credentials::{CredentialStore, Rotation};
use crate::metadata::{self, MediaKind};
use crate::prompt::{ParsedReply, PromptSpec, PARSE_FAILED};
use crate::status::{ItemStatus, StatusTracker};

/// One file's pending processing request.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub path: PathBuf,
    /// Model identifier used for this item's completion calls.
    pub model: String,
    /// Per-item retry budget; `None` uses the configured global budget.
    pub retry_budget: Option<u32>,
}

impl WorkItem {
    pub fn new(path: PathBuf, model: String) -> Self {
        Self {
            path,
            model,
            retry_budget: None,
        }
    }
}

/// What one attempt cycle produced for an item.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub caption: String,
    pub tags: String,
    pub success: bool,
}

/// Terminal outcome of processing one dequeued item. Exactly one of these is
/// reached for every item, and the status tracker is updated on every path.
#[derive(Debug)]
pub enum ItemOutcome {
    Succeeded {
        result: GenerationResult,
        /// Set when generation succeeded but the metadata write failed — a
        /// partial failure, surfaced instead of rolling back the success.
        embed_error: Option<String>,
        sidecar: Option<PathBuf>,
    },
    Failed {
        reason: String,
    },
    /// Every credential is rate limited; the whole queue should halt.
    Exhausted,
}

enum ItemState {
    Attempting,
    WaitingBeforeRetry,
    RotatingCredential,
}

enum AttemptFailure {
    RateLimited(String),
    Blocked(String),
    Credential(String),
    Transient(String),
}

impl From<AiError> for AttemptFailure {
    fn from(err: AiError) -> Self {
        match err {
            AiError::RateLimited(msg) => AttemptFailure::RateLimited(msg),
            AiError::Blocked(reason) => AttemptFailure::Blocked(reason),
            AiError::Transport(msg) => AttemptFailure::Transient(msg),
        }
    }
}

type ActiveService = Option<(usize, String, Arc<dyn CompletionService>)>;

/// Drives the attempt/rotate/retry cycle for work items.
///
/// Holds the credential store and the active completion service; the service
/// is rebuilt through the factory whenever the current credential or model
/// changes, so a request is never issued with a stale configuration.
pub struct Processor {
    settings: Arc<Settings>,
    factory: Box<dyn ServiceFactory>,
    credentials: Mutex<CredentialStore>,
    service: tokio::sync::Mutex<ActiveService>,
    tracker: StatusTracker,
}

impl Processor {
    pub fn new(
        settings: Arc<Settings>,
        factory: Box<dyn ServiceFactory>,
        tracker: StatusTracker,
    ) -> Self {
        let current = settings
            .current_key_index
            .or(if settings.api_keys.is_empty() {
                None
            } else {
                Some(0)
            });
        let credentials = Mutex::new(CredentialStore::new(settings.api_keys.clone(), current));
        Self {
            settings,
            factory,
            credentials,
            service: tokio::sync::Mutex::new(None),
            tracker,
        }
    }

    pub fn credentials(&self) -> &Mutex<CredentialStore> {
        &self.credentials
    }

    /// Run one item to its terminal outcome.
    ///
    /// `cancel` is checked between attempts: an item mid-attempt finishes
    /// that attempt, but starts no further ones once a stop was requested.
    pub async fn process_item(&self, item: &WorkItem, cancel: &AtomicBool) -> ItemOutcome {
        let spec = PromptSpec::from_settings(&self.settings);
        let budget = item.retry_budget.unwrap_or(self.settings.retry_count).max(1);
        let delay = Duration::from_secs_f64(self.settings.delay_seconds.max(0.0));
        let credential_count = self.credentials.lock().unwrap().len();

        let mut attempts_used: u32 = 0;
        let mut consecutive_rate_limits: usize = 0;
        let mut first_attempt = true;
        let mut state = ItemState::Attempting;

        let outcome = loop {
            match state {
                ItemState::Attempting => {
                    if !first_attempt && cancel.load(Ordering::SeqCst) {
                        let reason = "processing stopped".to_string();
                        self.tracker.record_failure(&item.path, reason.clone());
                        break ItemOutcome::Failed { reason };
                    }
                    first_attempt = false;

                    log::info!(
                        "generating caption and tags for {} (attempt {}/{budget})",
                        item.path.display(),
                        attempts_used + 1
                    );

                    match self.attempt(item, &spec).await {
                        Ok(parsed) => break self.finish_success(item, parsed),
                        Err(AttemptFailure::RateLimited(msg)) => {
                            log::warn!("rate limit on {}: {msg}", item.path.display());
                            consecutive_rate_limits += 1;
                            if consecutive_rate_limits >= credential_count.max(1) {
                                // a full ring of rate limits: nothing left to rotate to
                                let reason = "all credentials exhausted".to_string();
                                self.tracker.record_failure(&item.path, reason);
                                break ItemOutcome::Exhausted;
                            }
                            self.tracker.log("rate limit hit, switching API credential");
                            state = ItemState::RotatingCredential;
                        }
                        Err(AttemptFailure::Blocked(reason)) => {
                            // the input itself is the cause; retrying cannot help
                            let reason = format!("content blocked: {reason}");
                            self.tracker.record_failure(&item.path, reason.clone());
                            break ItemOutcome::Failed { reason };
                        }
                        Err(AttemptFailure::Credential(reason)) => {
                            self.tracker.record_failure(&item.path, reason.clone());
                            break ItemOutcome::Failed { reason };
                        }
                        Err(AttemptFailure::Transient(msg)) => {
                            consecutive_rate_limits = 0;
                            attempts_used += 1;
                            log::warn!(
                                "attempt {attempts_used}/{budget} failed for {}: {msg}",
                                item.path.display()
                            );
                            if attempts_used >= budget {
                                let reason = format!("failed after {budget} attempt(s): {msg}");
                                self.tracker.record_failure(&item.path, reason.clone());
                                break ItemOutcome::Failed { reason };
                            }
                            self.tracker.set_status(&item.path, ItemStatus::WaitingRetry);
                            state = ItemState::WaitingBeforeRetry;
                        }
                    }
                }
                ItemState::WaitingBeforeRetry => {
                    tokio::time::sleep(delay).await;
                    state = ItemState::Attempting;
                }
                ItemState::RotatingCredential => {
                    match self.rotate_credential(&item.model).await {
                        Some(index) => {
                            self.tracker
                                .log(format!("switched to API credential {index}"));
                            // rate-limit retries are free: the attempt budget
                            // is only consumed by transient failures
                            tokio::time::sleep(delay).await;
                            state = ItemState::Attempting;
                        }
                        None => {
                            let reason = "all credentials exhausted".to_string();
                            self.tracker.record_failure(&item.path, reason);
                            break ItemOutcome::Exhausted;
                        }
                    }
                }
            }
        };

        // fixed throttle before control returns to the queue, success or not
        tokio::time::sleep(delay).await;
        outcome
    }

    async fn attempt(
        &self,
        item: &WorkItem,
        spec: &PromptSpec,
    ) -> Result<ParsedReply, AttemptFailure> {
        let bytes = tokio::fs::read(&item.path)
            .await
            .map_err(|e| AttemptFailure::Transient(format!("failed to read file: {e}")))?;
        let image_base64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes);
        let mime_type = MediaKind::from_path(&item.path)
            .map(|k| k.mime_type())
            .unwrap_or("image/jpeg");
        let filename = item
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prompt = spec.build(&filename);

        let service = self.configured_service(&item.model).await?;
        let timeout = Duration::from_secs(self.settings.response_timeout_secs);
        let reply = match tokio::time::timeout(
            timeout,
            service.complete(
                &prompt,
                &image_base64,
                mime_type,
                &self.settings.safety_settings,
            ),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(AttemptFailure::Transient(format!(
                    "no response within {}s",
                    timeout.as_secs()
                )))
            }
        };

        let parsed = spec.parse_reply(&reply);

        // success needs at least one *enabled* output to have parsed; the
        // other may carry its sentinel without failing the item
        let caption_parsed = spec.caption_requested() && parsed.caption.is_some();
        let tags_parsed = spec.tags_requested() && parsed.tags.is_some();
        if !caption_parsed && !tags_parsed {
            return Err(AttemptFailure::Transient(
                "reply contained no parsable CAPTION:/TAGS: section".to_string(),
            ));
        }

        Ok(parsed)
    }

    /// Get the completion service for the current credential, rebuilding it
    /// if the credential or model changed since the last request.
    async fn configured_service(
        &self,
        model: &str,
    ) -> Result<Arc<dyn CompletionService>, AttemptFailure> {
        let (index, token) = {
            let store = self.credentials.lock().unwrap();
            match (store.current(), store.current_token()) {
                (Some(i), Some(t)) => (i, t.to_string()),
                _ => {
                    return Err(AttemptFailure::Credential(
                        "no API credentials configured".to_string(),
                    ))
                }
            }
        };

        let mut guard = self.service.lock().await;
        let up_to_date =
            matches!(&*guard, Some((i, m, _)) if *i == index && m.as_str() == model);
        if !up_to_date {
            let service = self.factory.build(&token, model).map_err(|e| {
                AttemptFailure::Credential(format!(
                    "failed to configure credential {index}: {e}"
                ))
            })?;
            *guard = Some((index, model.to_string(), Arc::from(service)));
        }
        match &*guard {
            Some((_, _, service)) => Ok(Arc::clone(service)),
            None => Err(AttemptFailure::Credential(
                "no completion service configured".to_string(),
            )),
        }
    }

    /// Rotate to the next credential that configures, installing its service.
    /// Returns the new index, or `None` when the ring is exhausted.
    async fn rotate_credential(&self, model: &str) -> Option<usize> {
        let rotation = {
            let mut store = self.credentials.lock().unwrap();
            store.rotate_with(|token| self.factory.build(token, model))
        };
        match rotation {
            Rotation::Switched { index, configured } => {
                let mut guard = self.service.lock().await;
                *guard = Some((index, model.to_string(), Arc::from(configured)));
                Some(index)
            }
            Rotation::Exhausted => None,
        }
    }

    fn finish_success(&self, item: &WorkItem, parsed: ParsedReply) -> ItemOutcome {
        let caption_text = parsed
            .caption
            .clone()
            .unwrap_or_else(|| PARSE_FAILED.to_string());
        let tags_text = parsed
            .tags
            .clone()
            .unwrap_or_else(|| PARSE_FAILED.to_string());

        // only parsed, non-empty fields are persisted
        let caption_field = parsed.caption.as_deref().filter(|s| !s.is_empty());
        let tags_field = parsed.tags.as_deref().filter(|s| !s.is_empty());

        let embed_error = metadata::write_metadata(&item.path, caption_field, tags_field)
            .err()
            .map(|e| format!("{e:#}"));
        if let Some(ref msg) = embed_error {
            log::warn!(
                "metadata embedding failed for {}: {msg}",
                item.path.display()
            );
            self.tracker
                .log(format!("metadata embedding failed: {msg}"));
        }

        let sidecar = if self.settings.save_txt {
            match write_sidecar(&item.path, caption_field, tags_field) {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("sidecar write failed for {}: {e:#}", item.path.display());
                    self.tracker.log(format!("sidecar write failed: {e:#}"));
                    None
                }
            }
        } else {
            None
        };

        let note = embed_error
            .as_ref()
            .map(|e| format!("metadata write failed: {e}"))
            .unwrap_or_default();
        self.tracker
            .record_success(&item.path, caption_text.clone(), tags_text.clone(), note);

        ItemOutcome::Succeeded {
            result: GenerationResult {
                caption: caption_text,
                tags: tags_text,
                success: true,
            },
            embed_error,
            sidecar,
        }
    }
}

/// Write the generated text next to the image: same base name, `.txt`.
pub fn write_sidecar(
    path: &Path,
    caption: Option<&str>,
    tags: Option<&str>,
) -> Result<PathBuf> {
    let sidecar = path.with_extension("txt");
    let mut contents = String::new();
    if let Some(caption) = caption {
        contents.push_str(caption);
        contents.push('\n');
    }
    if let Some(tags) = tags {
        contents.push_str(tags);
        contents.push('\n');
    }
    std::fs::write(&sidecar, contents)?;
    Ok(sidecar)
}

/// Collect supported image files from a mix of file and directory paths.
/// Directories are walked recursively; files that do not sniff as images are
/// skipped with a warning.
pub fn collect_images(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for path in paths {
        if path.is_file() {
            if is_supported_image(path) {
                images.push(path.clone());
            } else {
                log::warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let p = entry.path();
                if p.is_file() && is_supported_image(p) {
                    images.push(p.to_path_buf());
                }
            }
        } else {
            log::warn!("Path does not exist: {}", path.display());
        }
    }

    images
}

/// A supported extension plus a header that sniffs as an image.
fn is_supported_image(path: &Path) -> bool {
    if MediaKind::from_path(path).is_none() {
        return false;
    }
    use std::io::Read;
    let mut head = [0u8; 64];
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let Ok(n) = file.read(&mut head) else {
        return false;
    };
    image::guess_format(&head[..n]).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::read_metadata;
    use crate::status::ItemStatus;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    // ── scripted test doubles ────────────────────────────────────────

    #[derive(Clone)]
    struct ScriptedService {
        replies: Arc<Mutex<VecDeque<Result<String, AiError>>>>,
        fallback: Option<Result<String, AiError>>,
        calls: Arc<AtomicUsize>,
        delay_ms: u64,
    }

    impl ScriptedService {
        fn new(replies: Vec<Result<String, AiError>>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into())),
                fallback: None,
                calls: Arc::new(AtomicUsize::new(0)),
                delay_ms: 0,
            }
        }

        fn always(reply: Result<String, AiError>) -> Self {
            let mut s = Self::new(Vec::new());
            s.fallback = Some(reply);
            s
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CompletionService for ScriptedService {
        fn name(&self) -> &str {
            "Scripted"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _image_base64: &str,
            _mime_type: &str,
            _safety: &[crate::config::SafetySetting],
        ) -> Result<String, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let scripted = self.replies.lock().unwrap().pop_front();
            match scripted.or_else(|| self.fallback.clone()) {
                Some(reply) => reply,
                None => Err(AiError::Transport("script exhausted".to_string())),
            }
        }
    }

    struct ScriptedFactory {
        services: Mutex<HashMap<String, ScriptedService>>,
        fail_builds: HashSet<String>,
    }

    impl ScriptedFactory {
        fn new(services: Vec<(&str, ScriptedService)>) -> Self {
            Self {
                services: Mutex::new(
                    services
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                ),
                fail_builds: HashSet::new(),
            }
        }
    }

    impl ServiceFactory for ScriptedFactory {
        fn build(
            &self,
            credential: &str,
            _model: &str,
        ) -> anyhow::Result<Box<dyn CompletionService>> {
            if self.fail_builds.contains(credential) {
                anyhow::bail!("configure failed for {credential}");
            }
            let service = self
                .services
                .lock()
                .unwrap()
                .get(credential)
                .cloned()
                .unwrap_or_else(|| {
                    ScriptedService::always(Err(AiError::Transport("unscripted".into())))
                });
            Ok(Box::new(service))
        }
    }

    fn test_settings(keys: &[&str]) -> Settings {
        let mut settings = Settings::default();
        settings.api_keys = keys.iter().map(|k| k.to_string()).collect();
        settings.current_key_index = if keys.is_empty() { None } else { Some(0) };
        settings.delay_seconds = 0.0;
        settings
    }

    fn fresh_png(dir: &Path) -> PathBuf {
        let path = dir.join("photo.png");
        image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();
        path
    }

    fn item(path: &Path) -> WorkItem {
        WorkItem::new(path.to_path_buf(), "gemini-1.5-flash".to_string())
    }


    // ── rotation scenario ────────────────────────────────────────────

    #[tokio::test]
    async fn rate_limited_credentials_rotate_until_one_succeeds() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let k2 = ScriptedService::always(Ok(
            "CAPTION: A cat.\nTAGS: one, two, three, four, five, six".to_string(),
        ));
        let factory = ScriptedFactory::new(vec![
            ("k0", ScriptedService::always(Err(AiError::RateLimited("429".into())))),
            ("k1", ScriptedService::always(Err(AiError::RateLimited("429".into())))),
            ("k2", k2.clone()),
        ]);

        let mut settings = test_settings(&["k0", "k1", "k2"]);
        settings.num_hashtags = 5;
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        assert!(matches!(outcome, ItemOutcome::Succeeded { embed_error: None, .. }));
        assert_eq!(processor.credentials().lock().unwrap().current(), Some(2));
        assert_eq!(k2.call_count(), 1);

        let record = tracker.get(&path).unwrap();
        assert_eq!(record.status, ItemStatus::Success);
        assert_eq!(record.caption, "A cat.");
        assert_eq!(record.tags, "one, two, three, four, five");

        // the result was embedded in the file
        assert_eq!(read_metadata(&path).caption, "A cat.");
    }

    // ── transient retry budget ───────────────────────────────────────

    #[tokio::test]
    async fn transient_failures_consume_the_budget_exactly() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let service = ScriptedService::always(Err(AiError::Transport("boom".into())));
        let factory = ScriptedFactory::new(vec![("k0", service.clone())]);

        let mut settings = test_settings(&["k0"]);
        settings.retry_count = 2;
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        assert!(matches!(outcome, ItemOutcome::Failed { .. }));
        assert_eq!(service.call_count(), 2);
        let record = tracker.get(&path).unwrap();
        assert_eq!(record.status, ItemStatus::Failed);
        assert!(record.note.contains("after 2 attempt"));
    }

    // ── blocked content ──────────────────────────────────────────────

    #[tokio::test]
    async fn blocked_content_is_terminal_without_retry() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let service = ScriptedService::always(Err(AiError::Blocked("SAFETY".into())));
        let factory = ScriptedFactory::new(vec![("k0", service.clone())]);

        let mut settings = test_settings(&["k0"]);
        settings.retry_count = 5;
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        match outcome {
            ItemOutcome::Failed { reason } => assert!(reason.contains("SAFETY")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(service.call_count(), 1);
        assert!(tracker.get(&path).unwrap().note.contains("SAFETY"));
    }

    // ── exhaustion ───────────────────────────────────────────────────

    #[tokio::test]
    async fn full_ring_of_rate_limits_is_exhausted() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let k0 = ScriptedService::always(Err(AiError::RateLimited("429".into())));
        let k1 = ScriptedService::always(Err(AiError::RateLimited("quota".into())));
        let factory = ScriptedFactory::new(vec![("k0", k0.clone()), ("k1", k1.clone())]);

        let settings = test_settings(&["k0", "k1"]);
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        assert!(matches!(outcome, ItemOutcome::Exhausted));
        assert_eq!(k0.call_count() + k1.call_count(), 2);
        let record = tracker.get(&path).unwrap();
        assert_eq!(record.status, ItemStatus::Failed);
        assert!(record.note.contains("exhausted"));
    }

    #[tokio::test]
    async fn rotation_with_no_configurable_credential_is_exhausted() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let mut factory = ScriptedFactory::new(vec![(
            "k0",
            ScriptedService::always(Err(AiError::RateLimited("429".into()))),
        )]);
        // k1 exists but can never be configured
        factory.fail_builds.insert("k1".to_string());

        let settings = test_settings(&["k0", "k1"]);
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;
        assert!(matches!(outcome, ItemOutcome::Exhausted));
    }

    #[tokio::test]
    async fn no_credentials_fails_terminally() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let factory = ScriptedFactory::new(vec![]);
        let settings = test_settings(&[]);
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;
        match outcome {
            ItemOutcome::Failed { reason } => assert!(reason.contains("credential")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    // ── partial parses ───────────────────────────────────────────────

    #[tokio::test]
    async fn caption_only_request_ignores_missing_tags_marker() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let service = ScriptedService::always(Ok("CAPTION: Quiet morning.".to_string()));
        let factory = ScriptedFactory::new(vec![("k0", service)]);

        let mut settings = test_settings(&["k0"]);
        settings.tags_enabled = false;
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        assert!(matches!(outcome, ItemOutcome::Succeeded { .. }));
        let record = tracker.get(&path).unwrap();
        assert_eq!(record.caption, "Quiet morning.");
        assert_eq!(record.tags, "");
    }

    #[tokio::test]
    async fn missing_tags_marker_with_both_enabled_succeeds_with_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let service = ScriptedService::always(Ok("CAPTION: Hello.".to_string()));
        let factory = ScriptedFactory::new(vec![("k0", service)]);

        let settings = test_settings(&["k0"]);
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        assert!(matches!(outcome, ItemOutcome::Succeeded { .. }));
        let record = tracker.get(&path).unwrap();
        assert_eq!(record.status, ItemStatus::Success);
        assert_eq!(record.caption, "Hello.");
        assert_eq!(record.tags, PARSE_FAILED);
    }

    #[tokio::test]
    async fn reply_with_no_markers_is_transient() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let service = ScriptedService::always(Ok("I cannot help with that.".to_string()));
        let factory = ScriptedFactory::new(vec![("k0", service.clone())]);

        let mut settings = test_settings(&["k0"]);
        settings.retry_count = 3;
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        assert!(matches!(outcome, ItemOutcome::Failed { .. }));
        assert_eq!(service.call_count(), 3);
    }

    // ── embedding failures ───────────────────────────────────────────

    #[tokio::test]
    async fn embed_failure_is_partial_not_a_generation_failure() {
        let dir = TempDir::new().unwrap();
        // a readable file the codec cannot embed into
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"some bytes").unwrap();

        let service = ScriptedService::always(Ok("CAPTION: Hi.\nTAGS: a, b".to_string()));
        let factory = ScriptedFactory::new(vec![("k0", service)]);

        let settings = test_settings(&["k0"]);
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        match outcome {
            ItemOutcome::Succeeded { embed_error, .. } => {
                assert!(embed_error.is_some());
            }
            other => panic!("expected Succeeded, got {other:?}"),
        }
        let record = tracker.get(&path).unwrap();
        assert_eq!(record.status, ItemStatus::Success);
        assert!(record.note.contains("metadata write failed"));
    }

    // ── sidecar ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn sidecar_is_written_when_enabled() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let service = ScriptedService::always(Ok("CAPTION: A dog.\nTAGS: dog, park".to_string()));
        let factory = ScriptedFactory::new(vec![("k0", service)]);

        let mut settings = test_settings(&["k0"]);
        settings.save_txt = true;
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;

        match outcome {
            ItemOutcome::Succeeded { sidecar: Some(sidecar), .. } => {
                let contents = std::fs::read_to_string(&sidecar).unwrap();
                assert!(contents.contains("A dog."));
                assert!(contents.contains("dog, park"));
                assert_eq!(sidecar, path.with_extension("txt"));
            }
            other => panic!("expected sidecar, got {other:?}"),
        }
    }

    // ── timeout ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn slow_response_times_out_as_transient() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let mut service = ScriptedService::always(Ok("CAPTION: late".to_string()));
        service.delay_ms = 200;
        let factory = ScriptedFactory::new(vec![("k0", service)]);

        let mut settings = test_settings(&["k0"]);
        settings.response_timeout_secs = 0;
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let outcome = processor.process_item(&item(&path), &AtomicBool::new(false)).await;
        match outcome {
            ItemOutcome::Failed { reason } => assert!(reason.contains("no response")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    // ── cancellation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_stops_after_the_current_attempt() {
        let dir = TempDir::new().unwrap();
        let path = fresh_png(dir.path());

        let service = ScriptedService::always(Err(AiError::Transport("boom".into())));
        let factory = ScriptedFactory::new(vec![("k0", service.clone())]);

        let mut settings = test_settings(&["k0"]);
        settings.retry_count = 5;
        let tracker = StatusTracker::new();
        let processor = Processor::new(Arc::new(settings), Box::new(factory), tracker.clone());

        let cancel = AtomicBool::new(true);
        let outcome = processor.process_item(&item(&path), &cancel).await;

        // the first attempt ran, later ones were cut off
        assert_eq!(service.call_count(), 1);
        match outcome {
            ItemOutcome::Failed { reason } => assert!(reason.contains("stopped")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    // ── collect_images ───────────────────────────────────────────────

    #[test]
    fn collect_images_sniffs_content() {
        let dir = TempDir::new().unwrap();
        let good = fresh_png(dir.path());
        std::fs::write(dir.path().join("fake.jpg"), b"not really a jpeg").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();

        let images = collect_images(&[dir.path().to_path_buf()]);
        assert_eq!(images, vec![good]);
    }

    #[test]
    fn collect_images_mixed_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        let file = fresh_png(dir.path());
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let nested = sub.join("deep.jpg");
        image::RgbImage::from_pixel(2, 2, image::Rgb([0, 0, 0]))
            .save(&nested)
            .unwrap();

        let mut images = collect_images(&[file.clone(), sub]);
        images.sort();
        let mut expected = vec![file, nested];
        expected.sort();
        assert_eq!(images, expected);
    }

    #[test]
    fn collect_images_nonexistent_path() {
        assert!(collect_images(&[PathBuf::from("/nonexistent/nowhere")]).is_empty());
    }
}
