use crate::config::Settings;

/// Reply label the model is instructed to put before the caption.
pub const CAPTION_MARKER: &str = "CAPTION:";
/// Reply label the model is instructed to put before the keyword list.
pub const TAGS_MARKER: &str = "TAGS:";

/// Sentinel stored in an image record when an expected reply marker was
/// absent. Distinct from a legitimately empty field.
pub const PARSE_FAILED: &str = "(reply could not be parsed)";

/// Everything needed to build one combined prompt and interpret its reply.
///
/// At least one of the two outputs is always requested: if a caller disables
/// both, captions are forced back on.
#[derive(Debug, Clone)]
pub struct PromptSpec {
    pub caption_template: String,
    pub tags_template: String,
    pub caption_enabled: bool,
    pub tags_enabled: bool,
    pub num_hashtags: usize,
    pub include_filename: bool,
    pub additional_caption: String,
    pub additional_tags: String,
}

/// Per-field parse results. `None` means the field was requested but its
/// marker was missing from the reply; a disabled field parses as empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub caption: Option<String>,
    pub tags: Option<String>,
}

impl PromptSpec {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut spec = Self {
            caption_template: settings.caption_prompt.clone(),
            tags_template: settings.tags_prompt.clone(),
            caption_enabled: settings.caption_enabled,
            tags_enabled: settings.tags_enabled,
            num_hashtags: settings.num_hashtags,
            include_filename: settings.include_filename,
            additional_caption: settings.additional_caption.clone(),
            additional_tags: settings.additional_tags.clone(),
        };
        if !spec.caption_enabled && !spec.tags_enabled {
            log::warn!("both outputs disabled; forcing caption generation on");
            spec.caption_enabled = true;
        }
        spec
    }

    /// Whether a caption will be requested (forced on when tags are off).
    pub fn caption_requested(&self) -> bool {
        self.caption_enabled || !self.tags_enabled
    }

    /// Whether tags will be requested.
    pub fn tags_requested(&self) -> bool {
        self.tags_enabled
    }

    /// Build the single combined prompt for one image.
    pub fn build(&self, filename: &str) -> String {
        let mut prompt = String::new();

        if self.include_filename {
            prompt.push_str(&format!("The image file is named \"{filename}\".\n\n"));
        }

        if self.caption_requested() {
            let mut template = self.caption_template.clone();
            if self.include_filename {
                template = template.replace("{filename}", filename);
            }
            prompt.push_str("CAPTION REQUEST:\n");
            prompt.push_str(&template);
            prompt.push_str("\n\n");
        }

        if self.tags_requested() {
            let mut template = self
                .tags_template
                .replace("{num_hashtags}", &self.num_hashtags.to_string());
            if self.include_filename {
                template = template.replace("{filename}", filename);
            }
            prompt.push_str("TAGS REQUEST:\n");
            prompt.push_str(&template);
            prompt.push_str("\n\n");
        }

        match (self.caption_requested(), self.tags_requested()) {
            (true, true) => prompt.push_str(
                "Answer using exactly this format, with both labels on their own lines:\n\
                 CAPTION: <the caption>\n\
                 TAGS: <the keywords, comma separated>",
            ),
            (true, false) => prompt.push_str(
                "Answer using exactly this format:\nCAPTION: <the caption>",
            ),
            (false, true) => prompt.push_str(
                "Answer using exactly this format:\nTAGS: <the keywords, comma separated>",
            ),
            (false, false) => unreachable!("caption is forced on when tags are off"),
        }

        prompt
    }

    /// Parse a model reply into its two fields. Never fails: a missing marker
    /// for an enabled field yields `None` for that field only, and each field
    /// is extracted independently of the other.
    pub fn parse_reply(&self, text: &str) -> ParsedReply {
        log::debug!("raw model reply:\n{text}");

        let caption = if self.caption_requested() {
            text.find(CAPTION_MARKER).map(|pos| {
                let after = &text[pos + CAPTION_MARKER.len()..];
                let end = after.find(TAGS_MARKER).unwrap_or(after.len());
                self.finish_caption(after[..end].trim())
            })
        } else {
            Some(String::new())
        };

        let tags = if self.tags_requested() {
            text.find(TAGS_MARKER)
                .map(|pos| self.normalize_tags(&text[pos + TAGS_MARKER.len()..]))
        } else {
            Some(String::new())
        };

        ParsedReply { caption, tags }
    }

    fn finish_caption(&self, raw: &str) -> String {
        let mut caption = raw.trim().to_string();
        if !self.additional_caption.is_empty() {
            if !caption.is_empty() {
                caption.push(' ');
            }
            caption.push_str(&self.additional_caption);
        }
        caption
    }

    /// Normalize the raw tag text: split on commas (or whitespace when the
    /// model answered in hashtag-list style), trim, strip a leading `#`, drop
    /// empties, and truncate to the requested count.
    fn normalize_tags(&self, raw: &str) -> String {
        let raw = raw.trim();
        let tokens: Vec<&str> = if raw.contains(',') {
            raw.split(',').collect()
        } else {
            raw.split_whitespace().collect()
        };

        let tags: Vec<String> = tokens
            .iter()
            .map(|t| t.trim())
            .map(|t| t.strip_prefix('#').unwrap_or(t))
            .filter(|t| !t.is_empty())
            .take(self.num_hashtags)
            .map(str::to_string)
            .collect();

        let mut joined = tags.join(", ");
        if !self.additional_tags.is_empty() {
            if !joined.is_empty() {
                joined.push(' ');
            }
            joined.push_str(&self.additional_tags);
        }
        joined
    }
}
