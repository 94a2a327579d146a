use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::models::GeneratedImage;
use crate::db::StorageError;
use crate::handlers::access::{is_user_authorized, secret_matches};
use crate::handlers::callback::{action_grid, CallbackError, CallbackToken, ImageAction};
use crate::handlers::responses::ChatReplier;
use crate::imagegen::{ImageClientError, VariantSlot};
use crate::state::AppState;
use crate::utils::download::TransferError;

pub const NOT_AUTHORIZED_MESSAGE: &str =
    "You are NOT in the list of known persons, you can't use this bot, sorry";
pub const AUTHORIZED_MESSAGE: &str = "You can use /imagine now";
pub const PONG_MESSAGE: &str = "pong";
pub const USAGE_MESSAGE: &str = "You should provide prompt, like\n<code>/imagine cat flying in the clouds in the style of Edward Tufte</code>";
pub const FAILURE_MESSAGE: &str = "Something went wrong, please try again";
pub const CACHE_MISS_MESSAGE: &str = "There was a problem with cache, try to request image again";
pub const UNKNOWN_COMMAND_MESSAGE: &str = "Unknown command";
pub const UNRECOGNIZED_BUTTON_MESSAGE: &str =
    "This button is not recognized, try to request image again";

const HELP_MESSAGE: &str = "<b>Commands</b>

/imagine &lt;prompt&gt; - generate four variants for a prompt
/auth &lt;secret&gt; - unlock the bot for your account
/ping - check that the bot is alive
/help - show this message

Under every result, U1-U4 upscale a variant and V1-V4 draw new variations of it.";

/// How an event ended, for timing logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    NotAuthorized,
    Ignored,
    MissingPrompt,
    CacheMiss,
    UnrecognizedCallback,
    UnknownAction,
    Failed,
}

impl Outcome {
    pub fn status(self) -> &'static str {
        match self {
            Outcome::Completed => "success",
            Outcome::NotAuthorized => "not_authorized",
            Outcome::Ignored => "ignored",
            Outcome::MissingPrompt => "missing_prompt",
            Outcome::CacheMiss => "cache_miss",
            Outcome::UnrecognizedCallback => "unrecognized_callback",
            Outcome::UnknownAction => "unknown_action",
            Outcome::Failed => "error",
        }
    }
}

#[derive(Debug, Error)]
enum BotError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("image service: {0}")]
    Image(#[from] ImageClientError),
    #[error("image job finished with progress {0:?}")]
    NotDone(String),
    #[error("download: {0}")]
    Transfer(#[from] TransferError),
    #[error("chat delivery: {0:#}")]
    Chat(#[from] anyhow::Error),
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Trims the prompt and rewrites em-dashes to `--`, the only flag
/// separator the image service understands. `None` when nothing is left.
pub fn normalize_prompt(raw: &str) -> Option<String> {
    let prompt = raw.trim();
    if prompt.is_empty() {
        return None;
    }
    Some(prompt.replace('\u{2014}', "--"))
}

fn link_fallback_message(uri: &str) -> String {
    format!(
        "Can't upload image, sorry, here is the link: {}",
        escape_html(uri)
    )
}

/// Send failures are logged and otherwise ignored.
async fn say(replier: &dyn ChatReplier, text: &str) {
    if let Err(err) = replier.send_text(text).await {
        warn!("Can't send message: {err:#}");
    }
}

async fn report_failure(replier: &dyn ChatReplier, operation: &str, err: BotError) -> Outcome {
    match &err {
        BotError::Image(inner) => error!("{operation} failed ({}): {err}", inner.kind()),
        _ => error!("{operation} failed: {err}"),
    }
    say(replier, FAILURE_MESSAGE).await;
    Outcome::Failed
}

/// `Some` when the sender may not continue; the reply has already been sent.
async fn deny_unless_authorized(
    state: &AppState,
    replier: &dyn ChatReplier,
    user_id: i64,
    operation: &str,
) -> Option<Outcome> {
    match is_user_authorized(state.mode, state.storage.as_ref(), user_id).await {
        Ok(true) => None,
        Ok(false) => {
            info!("Rejecting {operation} from unauthorized user {user_id}");
            say(replier, NOT_AUTHORIZED_MESSAGE).await;
            Some(Outcome::NotAuthorized)
        }
        Err(err) => Some(report_failure(replier, operation, err.into()).await),
    }
}

fn ensure_done(image: &GeneratedImage) -> Result<(), BotError> {
    if image.is_done() {
        Ok(())
    } else {
        Err(BotError::NotDone(image.progress.clone()))
    }
}

/// Caches the result, then sends it as a photo under a fresh action grid.
/// Falls back to a plain link when the file cannot be fetched or uploaded.
async fn send_image_with_grid(
    state: &AppState,
    replier: &dyn ChatReplier,
    image: &GeneratedImage,
) -> Result<(), BotError> {
    state.storage.cache_generated_image(image).await?;
    let grid = action_grid(&image.id);

    let delivered = match state.downloader.download(&image.uri).await {
        Ok(file) => replier
            .send_photo(file.path(), &grid)
            .await
            .map_err(BotError::Chat),
        Err(err) => Err(BotError::Transfer(err)),
    };

    if let Err(err) = delivered {
        warn!("Can't send image {}: {err}", image.id);
        replier
            .send_text_with_grid(&link_fallback_message(&image.uri), &grid)
            .await?;
    }
    Ok(())
}

pub async fn start_handler(
    state: &AppState,
    replier: &dyn ChatReplier,
    user_id: i64,
    first_name: &str,
) -> Outcome {
    say(replier, &format!("Welcome {}", escape_html(first_name))).await;
    match deny_unless_authorized(state, replier, user_id, "start").await {
        Some(outcome) => outcome,
        None => Outcome::Completed,
    }
}

pub async fn auth_handler(
    state: &AppState,
    replier: &dyn ChatReplier,
    user_id: i64,
    secret: &str,
) -> Outcome {
    if !state.mode.requires_authorization() {
        say(replier, AUTHORIZED_MESSAGE).await;
        return Outcome::Completed;
    }
    if !secret_matches(&state.auth_password, secret) {
        info!("Ignoring /auth with a wrong secret from user {user_id}");
        return Outcome::Ignored;
    }

    if let Err(err) = state.storage.add_authorized_user(user_id).await {
        return report_failure(replier, "auth", err.into()).await;
    }
    info!("User {user_id} authorized");
    say(replier, AUTHORIZED_MESSAGE).await;
    Outcome::Completed
}

pub async fn ping_handler(replier: &dyn ChatReplier) -> Outcome {
    say(replier, PONG_MESSAGE).await;
    Outcome::Completed
}

pub async fn help_handler(replier: &dyn ChatReplier) -> Outcome {
    say(replier, HELP_MESSAGE).await;
    Outcome::Completed
}

pub async fn unknown_command_handler(replier: &dyn ChatReplier) -> Outcome {
    say(replier, UNKNOWN_COMMAND_MESSAGE).await;
    Outcome::Ignored
}

pub async fn imagine_handler(
    state: &AppState,
    replier: &dyn ChatReplier,
    user_id: i64,
    raw_prompt: &str,
) -> Outcome {
    if let Some(outcome) = deny_unless_authorized(state, replier, user_id, "imagine").await {
        return outcome;
    }
    let Some(prompt) = normalize_prompt(raw_prompt) else {
        say(replier, USAGE_MESSAGE).await;
        return Outcome::MissingPrompt;
    };

    info!("PROMPT: {prompt}");
    say(
        replier,
        &format!(
            "I'm starting to come up with: <b>{}</b>\nWait a bit, it may take some time",
            escape_html(&prompt)
        ),
    )
    .await;

    let result = async {
        let image = state.images.imagine(&prompt).await?;
        ensure_done(&image)?;
        send_image_with_grid(state, replier, &image).await
    }
    .await;

    match result {
        Ok(()) => Outcome::Completed,
        Err(err) => report_failure(replier, "imagine", err).await,
    }
}

async fn upscale_action(
    state: &AppState,
    replier: &dyn ChatReplier,
    source: &GeneratedImage,
    slot: VariantSlot,
) -> Result<(), BotError> {
    say(
        replier,
        &format!("Upscale version {slot}\nWait a bit, it may take some time"),
    )
    .await;
    let image = state.images.upscale(source, slot).await?;
    ensure_done(&image)?;
    let file = state.downloader.download(&image.uri).await?;
    replier.send_document(file.path()).await?;
    Ok(())
}

async fn variant_action(
    state: &AppState,
    replier: &dyn ChatReplier,
    source: &GeneratedImage,
    slot: VariantSlot,
) -> Result<(), BotError> {
    say(
        replier,
        &format!("New variations for version {slot}\nWait a bit, it may take some time"),
    )
    .await;
    let image = state.images.variant(source, slot).await?;
    ensure_done(&image)?;
    send_image_with_grid(state, replier, &image).await
}

/// Handles a press on one of the U1-U4 / V1-V4 buttons.
pub async fn image_action_callback(
    state: &AppState,
    replier: &dyn ChatReplier,
    user_id: i64,
    data: &str,
) -> Outcome {
    if let Some(outcome) = deny_unless_authorized(state, replier, user_id, "callback").await {
        return outcome;
    }

    let token = match CallbackToken::parse(data) {
        Ok(token) => token,
        Err(CallbackError::Malformed(payload)) => {
            warn!("Unrecognized callback payload {payload:?}");
            say(replier, UNRECOGNIZED_BUTTON_MESSAGE).await;
            return Outcome::UnrecognizedCallback;
        }
        Err(CallbackError::UnknownAction(code)) => {
            warn!("Unknown callback action {code:?}");
            say(replier, UNKNOWN_COMMAND_MESSAGE).await;
            return Outcome::UnknownAction;
        }
    };

    let source = match state
        .storage
        .get_cached_generated_image(&token.image_id)
        .await
    {
        Ok(Some(source)) => source,
        Ok(None) => {
            info!("No cached image for {}", token.image_id);
            say(replier, CACHE_MISS_MESSAGE).await;
            return Outcome::CacheMiss;
        }
        Err(err) => return report_failure(replier, "callback", err.into()).await,
    };

    let result = match token.action {
        ImageAction::Upscale(slot) => upscale_action(state, replier, &source, slot).await,
        ImageAction::Variant(slot) => variant_action(state, replier, &source, slot).await,
    };
    match result {
        Ok(()) => Outcome::Completed,
        Err(err) => report_failure(replier, &format!("callback {}", token.encode()), err).await,
    }
}
