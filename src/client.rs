use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::bus::{chat_topic, MessageBus};
use crate::models::{ChannelUpdate, MessagesResponse};

/// Client for the chat server's HTTP API.
#[derive(Clone)]
pub struct ChatApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ChatApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Fetch the current message list for a channel.
    pub async fn channel_messages(&self, channel_id: u64) -> Result<MessagesResponse> {
        let url = format!("{}/chat/{}/messages", self.base_url, channel_id);

        debug!("Fetching channel messages from {url}");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send channel messages request")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat API error ({}): {}", status, error_body);
        }

        response
            .json()
            .await
            .context("Failed to parse channel messages response")
    }
}

/// Periodically re-fetch a channel and publish messages not seen before onto
/// its bus topic as `sent` updates. This is the transport adapter that feeds
/// the in-process bus when no real push channel is available.
pub async fn poll_channel(
    api: ChatApiClient,
    bus: MessageBus,
    channel_id: u64,
    interval: Duration,
    mut last_seen: u64,
) {
    let topic = chat_topic(channel_id);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; the initial fetch already happened.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let response = match api.channel_messages(channel_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Channel poll failed: {e:#}");
                continue;
            }
        };

        for chat_message in response.chat_messages {
            if chat_message.id <= last_seen {
                continue;
            }
            last_seen = chat_message.id;
            debug!("Poller found new message {}", chat_message.id);
            match serde_json::to_value(ChannelUpdate::Sent { chat_message }) {
                Ok(payload) => {
                    bus.publish(&topic, payload).await;
                }
                Err(e) => warn!("Failed to encode polled message: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn single_message_response() -> MessagesResponse {
        serde_json::from_value(json!({
            "meta": { "channel_id": 1 },
            "chat_messages": [{
                "id": 1891,
                "message": "Hey @user1",
                "cooked": "<p>Hey <a class=\"mention\" href=\"/u/user1\">@user1</a></p>",
                "mentioned_users": [{ "id": 1000, "username": "user1" }],
                "user": { "id": 1, "username": "jesse" },
            }],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn fetches_and_parses_channel_messages() {
        let response = single_message_response();
        let router = Router::new().route(
            "/chat/{channel_id}/messages",
            get(move || {
                let response = response.clone();
                async move { Json(response) }
            }),
        );
        // Trailing slash is normalized away.
        let base_url = format!("{}/", serve(router).await);

        let api = ChatApiClient::new(base_url);
        let fetched = api.channel_messages(1).await.unwrap();

        assert_eq!(fetched.meta.channel_id, 1);
        assert_eq!(fetched.chat_messages[0].id, 1891);
    }

    #[tokio::test]
    async fn surfaces_http_errors_with_status() {
        let router = Router::new().route(
            "/chat/{channel_id}/messages",
            get(|| async { (StatusCode::NOT_FOUND, "no such channel") }),
        );
        let base_url = serve(router).await;

        let err = ChatApiClient::new(base_url)
            .channel_messages(1)
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("404"), "unexpected error: {message}");
        assert!(message.contains("no such channel"));
    }

    #[tokio::test]
    async fn poller_publishes_unseen_messages_as_sent_updates() {
        let response = single_message_response();
        let router = Router::new().route(
            "/chat/{channel_id}/messages",
            get(move || {
                let response = response.clone();
                async move { Json(response) }
            }),
        );
        let base_url = serve(router).await;

        let bus = MessageBus::new();
        let mut updates = bus.subscribe(&chat_topic(1)).await;
        let poller = tokio::spawn(poll_channel(
            ChatApiClient::new(base_url),
            bus.clone(),
            1,
            Duration::from_millis(10),
            0,
        ));

        let payload = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("poller should publish within the timeout")
            .unwrap();
        poller.abort();

        let update: ChannelUpdate = serde_json::from_value(payload).unwrap();
        let ChannelUpdate::Sent { chat_message } = update else {
            panic!("expected a sent update");
        };
        assert_eq!(chat_message.id, 1891);
    }

    #[tokio::test]
    async fn poller_skips_messages_already_seen() {
        let response = single_message_response();
        let router = Router::new().route(
            "/chat/{channel_id}/messages",
            get(move || {
                let response = response.clone();
                async move { Json(response) }
            }),
        );
        let base_url = serve(router).await;

        let bus = MessageBus::new();
        let mut updates = bus.subscribe(&chat_topic(1)).await;
        let poller = tokio::spawn(poll_channel(
            ChatApiClient::new(base_url),
            bus.clone(),
            1,
            Duration::from_millis(10),
            1891,
        ));

        let result =
            tokio::time::timeout(Duration::from_millis(200), updates.recv()).await;
        poller.abort();

        assert!(result.is_err(), "already-seen message was republished");
    }
}
