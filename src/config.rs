use anyhow::{Context, Result};
use fernet::Fernet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Number of saved prompt-template combination slots.
pub const PROMPT_SLOT_COUNT: usize = 5;

/// Gemini models known to work with image input.
pub const MODEL_OPTIONS: &[&str] = &["gemini-1.5-flash", "gemini-1.5-pro", "gemini-2.0-flash"];

pub const DEFAULT_CAPTION_PROMPT: &str = "Write a long accurate caption describing the image \
strictly in English. Focus on the most prominent objects, actions, and scenes. If famous \
people are identified in the image, always include their names.";

pub const DEFAULT_TAGS_PROMPT: &str = "Generate exactly {num_hashtags} strictly English \
keywords describing people, objects, clothes, actions, or scenes in the image. Use \
underscores between multi-word keywords and give them in a single comma-separated line \
with no numbering and no remarks.";

/// Harm categories the completion provider can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarmCategory {
    Harassment,
    HateSpeech,
    SexuallyExplicit,
    DangerousContent,
}

impl HarmCategory {
    pub const ALL: [HarmCategory; 4] = [
        HarmCategory::Harassment,
        HarmCategory::HateSpeech,
        HarmCategory::SexuallyExplicit,
        HarmCategory::DangerousContent,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            HarmCategory::Harassment => "HARM_CATEGORY_HARASSMENT",
            HarmCategory::HateSpeech => "HARM_CATEGORY_HATE_SPEECH",
            HarmCategory::SexuallyExplicit => "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            HarmCategory::DangerousContent => "HARM_CATEGORY_DANGEROUS_CONTENT",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.wire_name() == name)
    }
}

/// Block thresholds, independently configurable per harm category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockThreshold {
    BlockNone,
    BlockOnlyHigh,
    BlockMediumAndAbove,
    BlockLowAndAbove,
}

impl BlockThreshold {
    pub const ALL: [BlockThreshold; 4] = [
        BlockThreshold::BlockNone,
        BlockThreshold::BlockOnlyHigh,
        BlockThreshold::BlockMediumAndAbove,
        BlockThreshold::BlockLowAndAbove,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            BlockThreshold::BlockNone => "BLOCK_NONE",
            BlockThreshold::BlockOnlyHigh => "BLOCK_ONLY_HIGH",
            BlockThreshold::BlockMediumAndAbove => "BLOCK_MEDIUM_AND_ABOVE",
            BlockThreshold::BlockLowAndAbove => "BLOCK_LOW_AND_ABOVE",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.wire_name() == name)
    }
}

/// One harm category with its configured block threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: BlockThreshold,
}

/// The default policy: every category blocked at medium and above.
pub fn default_safety_policy() -> Vec<SafetySetting> {
    HarmCategory::ALL
        .iter()
        .map(|&category| SafetySetting {
            category,
            threshold: BlockThreshold::BlockMediumAndAbove,
        })
        .collect()
}

/// A saved caption/tags prompt-template combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSlot {
    pub caption_prompt: String,
    pub tags_prompt: String,
    pub num_hashtags: usize,
}

/// All persisted settings.
///
/// Constructed once (loaded through [`SettingsStore`] or via `Default`) and
/// passed by reference into the processor, queue, and formatter — there is no
/// global settings state.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_keys: Vec<String>,
    pub current_key_index: Option<usize>,
    pub selected_model: String,
    /// Attempts allowed per item for transient failures.
    pub retry_count: u32,
    /// Delay applied after every attempt, fractional seconds.
    pub delay_seconds: f64,
    pub num_hashtags: usize,
    pub caption_prompt: String,
    pub tags_prompt: String,
    /// Upper bound on a single completion call, clamped to 30–300 on load.
    pub response_timeout_secs: u64,
    pub caption_enabled: bool,
    pub tags_enabled: bool,
    /// Write a `.txt` sidecar next to each image with the generated text.
    pub save_txt: bool,
    pub additional_caption: String,
    pub additional_tags: String,
    /// Include the image filename as context in the prompt.
    pub include_filename: bool,
    /// Worker count for the processing queue.
    pub concurrency: usize,
    pub safety_settings: Vec<SafetySetting>,
    /// Fixed bank of saved prompt combinations, always `PROMPT_SLOT_COUNT` long.
    pub prompt_slots: Vec<Option<PromptSlot>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            current_key_index: None,
            selected_model: "gemini-1.5-flash".to_string(),
            retry_count: 1,
            delay_seconds: 1.0,
            num_hashtags: 10,
            caption_prompt: DEFAULT_CAPTION_PROMPT.to_string(),
            tags_prompt: DEFAULT_TAGS_PROMPT.to_string(),
            response_timeout_secs: 30,
            caption_enabled: true,
            tags_enabled: true,
            save_txt: false,
            additional_caption: String::new(),
            additional_tags: String::new(),
            include_filename: false,
            concurrency: 1,
            safety_settings: default_safety_policy(),
            prompt_slots: vec![None; PROMPT_SLOT_COUNT],
        }
    }
}

impl Settings {
    /// Store a prompt combination in the fixed slot bank.
    pub fn save_prompt_slot(&mut self, index: usize, slot: PromptSlot) -> Result<()> {
        if index >= PROMPT_SLOT_COUNT {
            anyhow::bail!("prompt slot {index} out of range (bank holds {PROMPT_SLOT_COUNT})");
        }
        self.prompt_slots[index] = Some(slot);
        Ok(())
    }

    pub fn prompt_slot(&self, index: usize) -> Result<Option<&PromptSlot>> {
        if index >= PROMPT_SLOT_COUNT {
            anyhow::bail!("prompt slot {index} out of range (bank holds {PROMPT_SLOT_COUNT})");
        }
        Ok(self.prompt_slots[index].as_ref())
    }

    fn from_raw(raw: RawSettings) -> Self {
        let mut safety_settings = Vec::new();
        for entry in raw.safety_settings {
            match (
                HarmCategory::from_wire_name(&entry.category),
                BlockThreshold::from_wire_name(&entry.threshold),
            ) {
                (Some(category), Some(threshold)) => {
                    safety_settings.push(SafetySetting { category, threshold });
                }
                _ => {
                    log::warn!(
                        "dropping invalid safety setting: {} / {}",
                        entry.category,
                        entry.threshold
                    );
                }
            }
        }
        if safety_settings.is_empty() {
            safety_settings = default_safety_policy();
        }

        let mut prompt_slots = raw.prompt_slots;
        prompt_slots.resize(PROMPT_SLOT_COUNT, None);
        prompt_slots.truncate(PROMPT_SLOT_COUNT);

        let current_key_index = raw.current_key_index.filter(|&i| i < raw.api_keys.len());

        Self {
            api_keys: raw.api_keys,
            current_key_index,
            selected_model: raw.selected_model,
            retry_count: raw.retry_count.max(1),
            delay_seconds: raw.delay_seconds.max(0.0),
            num_hashtags: raw.num_hashtags,
            caption_prompt: raw.caption_prompt,
            tags_prompt: raw.tags_prompt,
            response_timeout_secs: raw.response_timeout_secs.clamp(30, 300),
            caption_enabled: raw.caption_enabled,
            tags_enabled: raw.tags_enabled,
            save_txt: raw.save_txt,
            additional_caption: raw.additional_caption,
            additional_tags: raw.additional_tags,
            include_filename: raw.include_filename,
            concurrency: raw.concurrency.max(1),
            safety_settings,
            prompt_slots,
        }
    }

    fn to_raw(&self) -> RawSettings {
        RawSettings {
            api_keys: self.api_keys.clone(),
            current_key_index: self.current_key_index,
            selected_model: self.selected_model.clone(),
            retry_count: self.retry_count,
            delay_seconds: self.delay_seconds,
            num_hashtags: self.num_hashtags,
            caption_prompt: self.caption_prompt.clone(),
            tags_prompt: self.tags_prompt.clone(),
            response_timeout_secs: self.response_timeout_secs,
            caption_enabled: self.caption_enabled,
            tags_enabled: self.tags_enabled,
            save_txt: self.save_txt,
            additional_caption: self.additional_caption.clone(),
            additional_tags: self.additional_tags.clone(),
            include_filename: self.include_filename,
            concurrency: self.concurrency,
            safety_settings: self
                .safety_settings
                .iter()
                .map(|s| RawSafetySetting {
                    category: s.category.wire_name().to_string(),
                    threshold: s.threshold.wire_name().to_string(),
                })
                .collect(),
            prompt_slots: self.prompt_slots.clone(),
        }
    }
}

/// Wire form of the settings blob. Every field defaults independently so a
/// partially written or older file still loads; enum values travel as strings
/// so unknown ones can be dropped with a warning instead of failing the load.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct RawSettings {
    api_keys: Vec<String>,
    current_key_index: Option<usize>,
    selected_model: String,
    retry_count: u32,
    delay_seconds: f64,
    num_hashtags: usize,
    caption_prompt: String,
    tags_prompt: String,
    response_timeout_secs: u64,
    caption_enabled: bool,
    tags_enabled: bool,
    save_txt: bool,
    additional_caption: String,
    additional_tags: String,
    include_filename: bool,
    concurrency: usize,
    safety_settings: Vec<RawSafetySetting>,
    prompt_slots: Vec<Option<PromptSlot>>,
}

impl Default for RawSettings {
    fn default() -> Self {
        Settings::default().to_raw()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawSafetySetting {
    category: String,
    threshold: String,
}

/// Encrypted settings persistence.
///
/// The settings file is a Fernet token; the key lives in a sibling file and is
/// generated on first use. Loading never fails: a missing, undecryptable, or
/// unparseable file falls back to defaults, which are then persisted.
pub struct SettingsStore {
    settings_path: PathBuf,
    key_path: PathBuf,
}

impl SettingsStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            settings_path: dir.join("settings.enc"),
            key_path: dir.join("settings.key"),
        }
    }

    /// Resolve the default settings directory — same directory as the executable.
    pub fn default_dir() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        Ok(exe_path
            .parent()
            .context("Failed to get executable directory")?
            .to_path_buf())
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    fn fernet(&self) -> Result<Fernet> {
        let key = if self.key_path.exists() {
            std::fs::read_to_string(&self.key_path)
                .context("Failed to read settings key file")?
                .trim()
                .to_string()
        } else {
            let key = Fernet::generate_key();
            std::fs::write(&self.key_path, &key).context("Failed to write settings key file")?;
            key
        };
        Fernet::new(&key).context("Settings key file is not a valid Fernet key")
    }

    /// Load settings, falling back to a persisted default object on any
    /// missing file, undecryptable blob, or parse failure.
    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                log::warn!(
                    "Settings file not found at {}. Using defaults.",
                    self.settings_path.display()
                );
                self.persist_defaults()
            }
            Err(e) => {
                log::warn!("Failed to load settings: {e:#}. Using defaults.");
                self.persist_defaults()
            }
        }
    }

    fn try_load(&self) -> Result<Option<Settings>> {
        if !self.settings_path.exists() {
            return Ok(None);
        }
        let token =
            std::fs::read_to_string(&self.settings_path).context("Failed to read settings file")?;
        let fernet = self.fernet()?;
        let decrypted = fernet
            .decrypt(token.trim())
            .map_err(|_| anyhow::anyhow!("settings file could not be decrypted"))?;
        let raw: RawSettings =
            serde_json::from_slice(&decrypted).context("Failed to parse settings")?;
        Ok(Some(Settings::from_raw(raw)))
    }

    fn persist_defaults(&self) -> Settings {
        let settings = Settings::default();
        if let Err(e) = self.save(&settings) {
            log::warn!("Failed to persist default settings: {e:#}");
        }
        settings
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        let json =
            serde_json::to_vec(&settings.to_raw()).context("Failed to serialize settings")?;
        let token = self.fernet()?.encrypt(&json);
        std::fs::write(&self.settings_path, token).context("Failed to write settings file")?;
        log::info!("Settings saved to {}", self.settings_path.display());
        Ok(())
    }
}
