use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MidjourneyConfig;
use crate::db::models::{GeneratedImage, PROGRESS_DONE};
use crate::imagegen::{ImageClient, ImageClientError, VariantSlot};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_image_timing;

const APPLICATION_ID: &str = "936929561302675456";
const IMAGINE_COMMAND_ID: &str = "938956540159881230";
const IMAGINE_COMMAND_VERSION: &str = "1237876415471554623";
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;
const POLL_PAGE_SIZE: usize = 50;
const ERROR_EMBED_COLOR: u32 = 0xFF0000;
const ERROR_BODY_LIMIT: usize = 400;

static PROGRESS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d{1,3})%\)").expect("valid progress pattern"));

#[derive(Debug, Clone, Deserialize)]
struct DiscordMessage {
    id: String,
    #[serde(default)]
    content: String,
    author: DiscordUser,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
    #[serde(default)]
    embeds: Vec<DiscordEmbed>,
    /// Echo of the nonce sent with the interaction; string or number.
    #[serde(default)]
    nonce: Option<JsonValue>,
    #[serde(default)]
    interaction_metadata: Option<DiscordInteraction>,
    #[serde(default)]
    interaction: Option<DiscordInteraction>,
    #[serde(default)]
    message_reference: Option<DiscordReference>,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordUser {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordAttachment {
    url: String,
    #[serde(default)]
    filename: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordEmbed {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    color: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordInteraction {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscordReference {
    #[serde(default)]
    message_id: Option<String>,
}

impl DiscordMessage {
    fn nonce_text(&self) -> Option<String> {
        match self.nonce.as_ref()? {
            JsonValue::String(value) => Some(value.clone()),
            JsonValue::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }

    fn interaction_id(&self) -> Option<&str> {
        self.interaction_metadata
            .as_ref()
            .or(self.interaction.as_ref())
            .map(|interaction| interaction.id.as_str())
    }

    fn referenced_id(&self) -> Option<&str> {
        self.message_reference
            .as_ref()
            .and_then(|reference| reference.message_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Imagine,
    Upscale(VariantSlot),
    Variation(VariantSlot),
}

impl JobKind {
    fn operation(self) -> &'static str {
        match self {
            JobKind::Imagine => "imagine",
            JobKind::Upscale(_) => "upscale",
            JobKind::Variation(_) => "variation",
        }
    }

    /// Whether a bot message's echoed prompt and suffix belong to this job.
    fn matches(self, prompt: &str, content: &str) -> bool {
        let Some(echoed) = echoed_prompt(content) else {
            return false;
        };
        if !prompts_match(echoed, prompt) {
            return false;
        }
        let suffix = content.rsplit("**").next().unwrap_or_default();
        match self {
            JobKind::Imagine => !suffix.contains("Image #") && !suffix.contains("Variations"),
            JobKind::Upscale(slot) => suffix.contains(&format!("Image #{}", slot.index())),
            JobKind::Variation(_) => suffix.contains("Variations"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    Pending { uri: Option<String>, progress: String },
    Finished { uri: String },
}

/// Follows one submitted interaction through the channel.
///
/// A bot message belongs to the job when it echoes the submitted nonce,
/// carries the interaction id learned from such a message, or replies to a
/// message already tied to the job (or to the source grid, for button
/// jobs). Everything else in the channel is somebody else's work.
#[derive(Debug)]
struct JobTracker {
    job: JobKind,
    prompt: String,
    nonce: String,
    source_id: Option<String>,
    interaction_id: Option<String>,
    linked: HashSet<String>,
    /// Highest message id read so far; the next page starts after it.
    cursor: u64,
    /// Progress message that the service edits in place.
    pending_id: Option<String>,
    last_progress: Option<String>,
}

impl JobTracker {
    fn new(job: JobKind, prompt: &str, nonce: u64, source_id: Option<&str>) -> Self {
        JobTracker {
            job,
            prompt: prompt.to_string(),
            nonce: nonce.to_string(),
            source_id: source_id.map(str::to_string),
            interaction_id: None,
            linked: HashSet::new(),
            cursor: nonce,
            pending_id: None,
            last_progress: None,
        }
    }

    fn advance(&mut self, message: &DiscordMessage) {
        self.cursor = self.cursor.max(message_id_value(&message.id));
    }

    fn link(&mut self, message: &DiscordMessage) -> bool {
        let interaction_id = message.interaction_id();
        let by_nonce = message.nonce_text().as_deref() == Some(self.nonce.as_str());
        let by_interaction =
            interaction_id.is_some() && interaction_id == self.interaction_id.as_deref();
        let by_reference = message.referenced_id().is_some_and(|id| {
            self.linked.contains(id) || self.source_id.as_deref() == Some(id)
        });

        if !(by_nonce || by_interaction || by_reference || self.linked.contains(&message.id)) {
            return false;
        }
        if by_nonce && self.interaction_id.is_none() {
            self.interaction_id = interaction_id.map(str::to_string);
        }
        self.linked.insert(message.id.clone());
        true
    }

    /// `Ok(Some(..))` once the job's final image shows up.
    fn observe(
        &mut self,
        message: &DiscordMessage,
    ) -> Result<Option<GeneratedImage>, ImageClientError> {
        if message.author.id != APPLICATION_ID || !self.link(message) {
            return Ok(None);
        }
        if let Some(reason) = error_embed(message) {
            return Err(ImageClientError::Rejected(reason));
        }
        if !self.job.matches(&self.prompt, &message.content) {
            return Ok(None);
        }

        match job_state(message) {
            JobState::Finished { uri } => {
                let hash = hash_from_uri(&uri).ok_or_else(|| {
                    ImageClientError::Decode(format!("no hash in result uri {uri}"))
                })?;
                let content = echoed_prompt(&message.content)
                    .unwrap_or(&self.prompt)
                    .to_string();
                Ok(Some(GeneratedImage {
                    id: message.id.clone(),
                    hash,
                    progress: PROGRESS_DONE.to_string(),
                    uri,
                    content,
                }))
            }
            JobState::Pending { uri, progress } => {
                self.pending_id = Some(message.id.clone());
                if self.last_progress.as_deref() != Some(progress.as_str()) {
                    log_progress(self.job.operation(), uri.as_deref(), &progress);
                    self.last_progress = Some(progress);
                }
                Ok(None)
            }
        }
    }
}

/// Text between the first pair of `**` markers.
fn echoed_prompt(content: &str) -> Option<&str> {
    let start = content.find("**")? + 2;
    let length = content[start..].find("**")?;
    Some(&content[start..start + length])
}

fn normalize_prompt(prompt: &str) -> String {
    let base = prompt.split(" --").next().unwrap_or(prompt);
    base.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The service may append default flags or rewrite spacing, so only the
/// text before the first flag is compared.
fn prompts_match(echoed: &str, submitted: &str) -> bool {
    normalize_prompt(echoed) == normalize_prompt(submitted)
}

fn job_state(message: &DiscordMessage) -> JobState {
    let attachment = message.attachments.first();
    let uri = attachment.map(|item| item.url.clone());

    if let Some(captures) = PROGRESS_PATTERN.captures(&message.content) {
        return JobState::Pending {
            uri,
            progress: format!("{}%", &captures[1]),
        };
    }
    if message.content.contains("(Waiting to start)") || message.content.contains("(Paused)") {
        return JobState::Pending {
            uri,
            progress: "0%".to_string(),
        };
    }

    match attachment {
        Some(item) if !is_preview(item) => JobState::Finished {
            uri: item.url.clone(),
        },
        _ => JobState::Pending {
            uri,
            progress: "finishing".to_string(),
        },
    }
}

fn is_preview(attachment: &DiscordAttachment) -> bool {
    let name = if attachment.filename.is_empty() {
        attachment.url.split('?').next().unwrap_or_default()
    } else {
        attachment.filename.as_str()
    };
    name.to_ascii_lowercase().ends_with(".webp")
}

fn error_embed(message: &DiscordMessage) -> Option<String> {
    message
        .embeds
        .iter()
        .find(|embed| embed.color == Some(ERROR_EMBED_COLOR))
        .map(|embed| {
            let title = embed.title.clone().unwrap_or_default();
            let description = embed.description.clone().unwrap_or_default();
            format!("{title} {description}").trim().to_string()
        })
}

/// Content hash the service embeds in result filenames: the part after the
/// last `_` and before the extension.
pub fn hash_from_uri(uri: &str) -> Option<String> {
    let path = uri.split(|ch| ch == '?' || ch == '#').next()?;
    let file = path.rsplit('/').next()?;
    let tail = file.rsplit('_').next()?;
    let hash = tail.split('.').next()?;
    if hash.is_empty() {
        None
    } else {
        Some(hash.to_string())
    }
}

fn snowflake_now() -> u64 {
    let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    now_ms.saturating_sub(DISCORD_EPOCH_MS) << 22
}

fn message_id_value(id: &str) -> u64 {
    id.parse::<u64>().unwrap_or_default()
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn log_progress(operation: &str, uri: Option<&str>, progress: &str) {
    info!(
        "{operation} loading {} progress {progress}",
        uri.unwrap_or("(no preview yet)")
    );
}

pub struct MidjourneyClient {
    config: MidjourneyConfig,
    client: Client,
}

impl MidjourneyClient {
    pub fn new(config: MidjourneyConfig) -> Self {
        MidjourneyClient {
            config,
            client: get_http_client().clone(),
        }
    }

    fn imagine_payload(&self, prompt: &str, nonce: u64) -> JsonValue {
        json!({
            "type": 2,
            "application_id": APPLICATION_ID,
            "guild_id": self.config.server_id,
            "channel_id": self.config.channel_id,
            "session_id": self.config.session_id,
            "nonce": nonce.to_string(),
            "data": {
                "version": IMAGINE_COMMAND_VERSION,
                "id": IMAGINE_COMMAND_ID,
                "name": "imagine",
                "type": 1,
                "options": [{ "type": 3, "name": "prompt", "value": prompt }],
                "application_command": {
                    "id": IMAGINE_COMMAND_ID,
                    "application_id": APPLICATION_ID,
                    "version": IMAGINE_COMMAND_VERSION,
                    "default_member_permissions": null,
                    "type": 1,
                    "nsfw": false,
                    "name": "imagine",
                    "description": "Create images with Midjourney",
                    "dm_permission": true,
                    "options": [{
                        "type": 3,
                        "name": "prompt",
                        "description": "The prompt to imagine",
                        "required": true
                    }]
                },
                "attachments": []
            }
        })
    }

    fn component_payload(&self, source: &GeneratedImage, custom_id: &str, nonce: u64) -> JsonValue {
        json!({
            "type": 3,
            "application_id": APPLICATION_ID,
            "guild_id": self.config.server_id,
            "channel_id": self.config.channel_id,
            "session_id": self.config.session_id,
            "message_flags": 0,
            "message_id": source.id,
            "nonce": nonce.to_string(),
            "data": {
                "component_type": 2,
                "custom_id": custom_id
            }
        })
    }

    fn channel_url(&self) -> String {
        format!(
            "{}/channels/{}/messages",
            self.config.api_url, self.config.channel_id
        )
    }

    async fn submit_interaction(&self, payload: &JsonValue) -> Result<(), ImageClientError> {
        let response = self
            .client
            .post(format!("{}/interactions", self.config.api_url))
            .header(reqwest::header::AUTHORIZATION, &self.config.token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!(
            "Interaction rejected with status {status}: {}",
            truncate_for_log(&body, ERROR_BODY_LIMIT)
        );
        Err(ImageClientError::Rejected(format!(
            "interaction failed with status {status}"
        )))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        what: &str,
    ) -> Result<T, ImageClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Reading {what} failed with status {status}: {}",
                truncate_for_log(&body, ERROR_BODY_LIMIT)
            );
            return Err(ImageClientError::Rejected(format!(
                "{what} read failed with status {status}"
            )));
        }
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|err| ImageClientError::Decode(format!("{what}: {err}")))
    }

    /// One page of messages posted after `after`, oldest first.
    async fn recent_messages(&self, after: u64) -> Result<Vec<DiscordMessage>, ImageClientError> {
        let response = self
            .client
            .get(self.channel_url())
            .header(reqwest::header::AUTHORIZATION, &self.config.token)
            .query(&[
                ("limit", POLL_PAGE_SIZE.to_string()),
                ("after", after.to_string()),
            ])
            .send()
            .await?;

        let mut messages: Vec<DiscordMessage> =
            self.read_json(response, "channel messages").await?;
        messages.sort_by_key(|message| message_id_value(&message.id));
        Ok(messages)
    }

    /// `None` when the message is gone; the service deletes progress
    /// messages once the result is posted.
    async fn fetch_message(&self, id: &str) -> Result<Option<DiscordMessage>, ImageClientError> {
        let response = self
            .client
            .get(format!("{}/{id}", self.channel_url()))
            .header(reqwest::header::AUTHORIZATION, &self.config.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.read_json(response, "progress message").await.map(Some)
    }

    /// Reads every new page, then re-reads the progress message seen on an
    /// earlier poll since edits do not move it past the cursor.
    async fn poll_once(
        &self,
        tracker: &mut JobTracker,
    ) -> Result<Option<GeneratedImage>, ImageClientError> {
        let pending_before = tracker.pending_id.clone();

        loop {
            let page = self.recent_messages(tracker.cursor).await?;
            for message in &page {
                tracker.advance(message);
                if let Some(image) = tracker.observe(message)? {
                    return Ok(Some(image));
                }
            }
            if page.len() < POLL_PAGE_SIZE {
                break;
            }
            debug!("Channel page full, reading on after {}", tracker.cursor);
        }

        let Some(pending_id) = pending_before else {
            return Ok(None);
        };
        match self.fetch_message(&pending_id).await? {
            Some(message) => tracker.observe(&message),
            None => {
                if tracker.pending_id.as_deref() == Some(pending_id.as_str()) {
                    tracker.pending_id = None;
                }
                Ok(None)
            }
        }
    }

    async fn wait_for_job(
        &self,
        mut tracker: JobTracker,
    ) -> Result<GeneratedImage, ImageClientError> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            if let Some(image) = self.poll_once(&mut tracker).await? {
                return Ok(image);
            }
            if Instant::now() >= deadline {
                return Err(ImageClientError::Timeout(self.config.timeout));
            }
        }
    }

    async fn run_component_job(
        &self,
        job: JobKind,
        source: &GeneratedImage,
        custom_id: String,
    ) -> Result<GeneratedImage, ImageClientError> {
        let metadata = json!({ "source_id": source.id, "custom_id": custom_id });
        log_image_timing(job.operation(), Some(metadata), || async {
            let nonce = snowflake_now();
            debug!("Submitting {} for message {}", job.operation(), source.id);
            self.submit_interaction(&self.component_payload(source, &custom_id, nonce))
                .await?;
            let tracker = JobTracker::new(job, &source.content, nonce, Some(&source.id));
            self.wait_for_job(tracker).await
        })
        .await
    }
}

pub fn upscale_custom_id(slot: VariantSlot, hash: &str) -> String {
    format!("MJ::JOB::upsample::{}::{hash}", slot.index())
}

pub fn variation_custom_id(slot: VariantSlot, hash: &str) -> String {
    format!("MJ::JOB::variation::{}::{hash}", slot.index())
}

#[async_trait]
impl ImageClient for MidjourneyClient {
    async fn imagine(&self, prompt: &str) -> Result<GeneratedImage, ImageClientError> {
        let metadata = json!({ "prompt_chars": prompt.chars().count() });
        log_image_timing("imagine", Some(metadata), || async {
            let nonce = snowflake_now();
            self.submit_interaction(&self.imagine_payload(prompt, nonce))
                .await?;
            self.wait_for_job(JobTracker::new(JobKind::Imagine, prompt, nonce, None))
                .await
        })
        .await
    }

    async fn upscale(
        &self,
        source: &GeneratedImage,
        slot: VariantSlot,
    ) -> Result<GeneratedImage, ImageClientError> {
        self.run_component_job(
            JobKind::Upscale(slot),
            source,
            upscale_custom_id(slot, &source.hash),
        )
        .await
    }

    async fn variant(
        &self,
        source: &GeneratedImage,
        slot: VariantSlot,
    ) -> Result<GeneratedImage, ImageClientError> {
        self.run_component_job(
            JobKind::Variation(slot),
            source,
            variation_custom_id(slot, &source.hash),
        )
        .await
    }
}
