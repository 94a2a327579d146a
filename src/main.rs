use std::error::Error;
use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

mod config;
mod db;
mod handlers;
mod imagegen;
mod state;
mod utils;

use config::Config;
use db::open_storage;
use handlers::commands;
use handlers::responses::TelegramReplier;
use imagegen::MidjourneyClient;
use state::AppState;
use utils::download::HttpDownloader;
use utils::logging::init_logging;
use utils::supervisor::{supervise, RestartPolicy};
use utils::telegram::start_chat_action_heartbeat;
use utils::timing::{complete_command_timer, start_callback_timer, start_command_timer};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Ping,
    Auth(String),
    Imagine(String),
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging(&config::log_level());
    let config = Config::load()?;
    info!("Starting Midjourney Telegram bot in {:?} mode", config.mode);

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("creating {}", config.download_dir.display()))?;

    let storage = open_storage(&config.storage, config.image_cache_ttl)?;
    if let Err(err) = storage.health_check().await {
        warn!("Storage is not reachable yet: {err}");
    }

    let state = AppState::new(
        config.mode,
        &config.auth_password,
        storage.clone(),
        Arc::new(MidjourneyClient::new(config.midjourney.clone())),
        Arc::new(HttpDownloader::new(config.download_dir.clone())),
    );

    let bot_token = config.bot_token.clone();
    let result = supervise(&RestartPolicy::from(&config.supervisor), move || {
        run_dispatcher(Bot::new(bot_token.clone()), state.clone())
    })
    .await;

    storage.close().await;
    result?;
    info!("Bot stopped");
    Ok(())
}

async fn run_dispatcher(bot: Bot, state: AppState) -> anyhow::Result<()> {
    let me = bot.get_me().await.context("getMe failed")?;
    info!("Connected to Telegram as @{}", me.username());

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(
            dptree::filter(|msg: Message| {
                msg.text()
                    .map(|text| text.trim_start().starts_with('/'))
                    .unwrap_or(false)
            })
            .endpoint(handle_unknown_command),
        )
        .endpoint(ignore_message);

    let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn sender_id(message: &Message) -> Option<i64> {
    message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    let Some(user_id) = sender_id(&message) else {
        return Ok(());
    };
    let replier = TelegramReplier::new(bot.clone(), message.chat.id, Some(message.id));

    match command {
        Command::Start => {
            let mut timer = start_command_timer("start", &message);
            let first_name = message
                .from
                .as_ref()
                .map(|user| user.first_name.clone())
                .unwrap_or_default();
            let outcome = commands::start_handler(&state, &replier, user_id, &first_name).await;
            complete_command_timer(&mut timer, outcome.status(), None);
        }
        Command::Help => {
            commands::help_handler(&replier).await;
        }
        Command::Ping => {
            commands::ping_handler(&replier).await;
        }
        Command::Auth(secret) => {
            let mut timer = start_command_timer("auth", &message);
            let outcome = commands::auth_handler(&state, &replier, user_id, &secret).await;
            complete_command_timer(&mut timer, outcome.status(), None);
        }
        Command::Imagine(prompt) => {
            let mut timer = start_command_timer("imagine", &message);
            let chat_id = message.chat.id;
            tokio::spawn(async move {
                let _heartbeat = start_chat_action_heartbeat(bot, chat_id, ChatAction::UploadPhoto);
                let outcome = commands::imagine_handler(&state, &replier, user_id, &prompt).await;
                complete_command_timer(&mut timer, outcome.status(), None);
            });
        }
    }
    Ok(())
}

async fn handle_unknown_command(bot: Bot, message: Message) -> HandlerResult {
    let replier = TelegramReplier::new(bot, message.chat.id, Some(message.id));
    commands::unknown_command_handler(&replier).await;
    Ok(())
}

async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> HandlerResult {
    if let Err(err) = bot.answer_callback_query(query.id.clone()).await {
        warn!("answer_callback_query failed: {err}");
    }

    let Some(data) = query.data.clone() else {
        return Ok(());
    };
    let Some(chat_id) = query.message.as_ref().map(|message| message.chat().id) else {
        return Ok(());
    };
    let Ok(user_id) = i64::try_from(query.from.id.0) else {
        return Ok(());
    };
    let reply_to = query.message.as_ref().map(|message| message.id());

    let mut timer = start_callback_timer(&query);
    tokio::spawn(async move {
        let _heartbeat = start_chat_action_heartbeat(bot.clone(), chat_id, ChatAction::UploadPhoto);
        let replier = TelegramReplier::new(bot, chat_id, reply_to);
        let outcome = commands::image_action_callback(&state, &replier, user_id, &data).await;
        complete_command_timer(&mut timer, outcome.status(), Some(data));
    });
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
