mod bus;
mod channel;
mod client;
mod config;
mod markup;
mod models;
mod status;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{chat_topic, MessageBus, USER_STATUS_TOPIC};
use crate::channel::{ChannelView, SubscribedView};
use crate::client::ChatApiClient;
use crate::config::Config;
use crate::models::MessagesResponse;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chatview=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--demo") {
        return run_demo().await;
    }

    // Load configuration
    let config_path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("  Server: {}", config.server.base_url);
    info!("  Channel: {}", config.server.channel_id);
    info!("  Poll interval: {}s", config.viewer.poll_interval_secs);

    run_live(config).await
}

/// Watch a real channel: initial fetch, then reprint the view whenever the
/// poller pushes something new through the bus.
async fn run_live(config: Config) -> Result<()> {
    let api = ChatApiClient::new(config.server.base_url.clone());
    let channel_id = config.server.channel_id;

    let mut view = ChannelView::new(channel_id, &config.viewer.emoji_base_url);
    view.load(&api).await?;
    let last_seen = view.last_message_id();

    let bus = MessageBus::new();
    let mut updates = bus.subscribe(&chat_topic(channel_id)).await;
    let mut statuses = bus.subscribe(USER_STATUS_TOPIC).await;
    let subscription = SubscribedView::spawn(&bus, view).await;
    print_view("channel", &subscription).await;

    let poll_interval = Duration::from_secs(config.viewer.poll_interval_secs.max(1));
    tokio::spawn(client::poll_channel(
        api,
        bus.clone(),
        channel_id,
        poll_interval,
        last_seen,
    ));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            update = updates.recv() => match update {
                Ok(_) => {
                    subscription.settle().await;
                    print_view("channel", &subscription).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            change = statuses.recv() => match change {
                Ok(_) => {
                    subscription.settle().await;
                    print_view("channel", &subscription).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

/// Self-contained showcase: an embedded server with one canned channel, plus
/// a scripted status update, live message, and status clear over the bus.
async fn run_demo() -> Result<()> {
    const DEMO_CHANNEL_ID: u64 = 1;

    info!("Running the built-in demo channel");
    let base_url = serve_demo_channel(demo_channel()?).await?;

    let api = ChatApiClient::new(base_url);
    let mut view = ChannelView::new(DEMO_CHANNEL_ID, "/images/emoji");
    view.load(&api).await?;

    let bus = MessageBus::new();
    let subscription = SubscribedView::spawn(&bus, view).await;
    print_view("initial load", &subscription).await;

    bus.publish(
        USER_STATUS_TOPIC,
        json!({ "1000": { "description": "off to dentist", "emoji": "tooth" } }),
    )
    .await;
    subscription.settle().await;
    print_view("after status update", &subscription).await;

    bus.publish(
        &chat_topic(DEMO_CHANNEL_ID),
        json!({
            "type": "sent",
            "chat_message": {
                "id": 2138,
                "message": "Hey @user2",
                "cooked": "<p>Hey <a class=\"mention\" href=\"/u/user2\">@user2</a></p>",
                "mentioned_users": [{
                    "id": 2000,
                    "username": "user2",
                    "status": { "description": "vacation", "emoji": "desert_island" },
                }],
                "user": { "id": 1, "username": "acting_user" },
            },
        }),
    )
    .await;
    subscription.settle().await;
    print_view("after live message", &subscription).await;

    bus.publish(USER_STATUS_TOPIC, json!({ "1000": null, "2000": null }))
        .await;
    subscription.settle().await;
    print_view("after statuses cleared", &subscription).await;

    Ok(())
}

fn demo_channel() -> Result<MessagesResponse> {
    serde_json::from_value(json!({
        "meta": { "channel_id": 1 },
        "chat_messages": [{
            "id": 1891,
            "message": "Hey @user1",
            "cooked": "<p>Hey <a class=\"mention\" href=\"/u/user1\">@user1</a></p>",
            "mentioned_users": [{
                "id": 1000,
                "username": "user1",
                "status": { "description": "surfing", "emoji": "surfing_man" },
            }],
            "user": { "id": 1, "username": "jesse" },
        }],
    }))
    .context("Failed to build the demo channel fixture")
}

async fn serve_demo_channel(response: MessagesResponse) -> Result<String> {
    let app = Router::new().route(
        "/chat/{channel_id}/messages",
        get(move || {
            let response = response.clone();
            async move { Json(response) }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind the demo server")?;
    let addr = listener
        .local_addr()
        .context("Failed to read the demo server address")?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Demo server error: {e}");
        }
    });

    info!("Demo chat server listening on http://{addr}");
    Ok(format!("http://{addr}"))
}

async fn print_view(heading: &str, subscription: &SubscribedView) {
    let view = subscription.view().lock().await;
    println!("--- {heading} ---");
    for rendered in view.messages() {
        println!("[{}] {}", rendered.message().user.username, rendered.to_html());
    }
    let mut seen = BTreeSet::new();
    for rendered in view.messages() {
        for mentioned in &rendered.message().mentioned_users {
            if !seen.insert(mentioned.username.clone()) {
                continue;
            }
            if let Some(badge) = view.status_badge(&mentioned.username) {
                println!(
                    "    @{} is {}",
                    mentioned.username,
                    badge.attr("title").unwrap_or("?")
                );
            }
        }
    }
    println!();
}
