use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{load_config, Bot, EventPayload};
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Args {
    /// Override the storage root for the persisted session.
    #[arg(long)]
    storage_root: Option<PathBuf>,
    /// Demo timer interval in seconds.
    #[arg(long, default_value_t = 60)]
    timer_secs: u64,
    /// Optional daily tick, e.g. --daily 09:00
    #[arg(long)]
    daily: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut config = load_config();
    if let Some(root) = args.storage_root {
        config.storage_root = root;
    }

    let bot = Bot::new(config)?;

    bot.handle("/login", |event| async move {
        if let EventPayload::LoginResult { success } = event.payload {
            if success {
                info!("logged in");
            } else {
                warn!("logged out, the supervisor will reconnect");
            }
        }
    });

    bot.handle("/msg/solo", |event| async move {
        if let EventPayload::Message(message) = event.payload {
            info!(from = %message.sender_user_name, content = %message.content, "direct message");
        }
    });

    bot.handle("/msg/group", |event| async move {
        if let EventPayload::Message(message) = event.payload {
            info!(
                group = %message.from_user_name,
                sender = %message.sender_user_name,
                at_me = message.at_me,
                content = %message.content,
                "group message"
            );
        }
    });

    bot.handle("/contact", |event| async move {
        if let EventPayload::ContactChange { kind, user_name } = event.payload {
            info!(?kind, %user_name, "contact changed");
        }
    });

    bot.add_timer(Duration::from_secs(args.timer_secs));
    bot.handle("/timer", |event| async move {
        if let EventPayload::TimerTick { count, .. } = event.payload {
            info!(count, "timer tick");
        }
    });

    if let Some(spec) = args.daily.as_deref() {
        bot.add_timing(spec)?;
        bot.handle("/timing", |event| async move {
            if let EventPayload::DailyTick { spec, count } = event.payload {
                info!(%spec, count, "daily tick");
            }
        });
    }

    bot.start().await
}
