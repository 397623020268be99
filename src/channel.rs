use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{chat_topic, MessageBus, USER_STATUS_TOPIC};
use crate::client::ChatApiClient;
use crate::markup::{self, Element, Node};
use crate::models::{ChannelUpdate, ChatMessage, StatusMap, UserId, UserStatus};
use crate::status::StatusRegistry;

/// Classes carried by a status badge element.
const BADGE_CLASS: &str = "emoji user-status";

fn mention_href(username: &str) -> String {
    format!("/u/{username}")
}

fn emoji_src(emoji_base_url: &str, emoji: &str) -> String {
    format!("{}/{}.png", emoji_base_url.trim_end_matches('/'), emoji)
}

fn is_badge(element: &Element) -> bool {
    element.tag == "img" && element.has_class("user-status")
}

fn is_mention_of(element: &Element, href: &str) -> bool {
    element.tag == "a" && element.has_class("mention") && element.attr("href") == Some(href)
}

/// Create-or-update (`Some`) or remove (`None`) the badge on every mention
/// anchor for `username` in the forest. Nothing else is touched.
fn set_mention_badges(
    nodes: &mut [Node],
    username: &str,
    status: Option<&UserStatus>,
    emoji_base_url: &str,
) {
    let href = mention_href(username);
    markup::walk_elements_mut(nodes, &mut |element| {
        if !is_mention_of(element, &href) {
            return;
        }
        match status {
            Some(status) => upsert_badge(element, status, emoji_base_url),
            None => element
                .children
                .retain(|child| !matches!(child, Node::Element(el) if is_badge(el))),
        }
    });
}

fn upsert_badge(anchor: &mut Element, status: &UserStatus, emoji_base_url: &str) {
    let src = emoji_src(emoji_base_url, &status.emoji);
    for child in &mut anchor.children {
        if let Node::Element(element) = child {
            if is_badge(element) {
                element.set_attr("src", &src);
                element.set_attr("title", &status.description);
                return;
            }
        }
    }
    let mut badge = Element::new("img");
    badge.set_attr("class", BADGE_CLASS);
    badge.set_attr("src", &src);
    badge.set_attr("title", &status.description);
    anchor.children.push(Node::Element(badge));
}

/// A chat message together with the markup tree its badges are reconciled
/// against.
#[derive(Debug)]
pub struct RenderedMessage {
    message: ChatMessage,
    nodes: Vec<Node>,
}

impl RenderedMessage {
    fn render(
        message: ChatMessage,
        registry: &StatusRegistry,
        emoji_base_url: &str,
    ) -> Result<Self> {
        let nodes = markup::parse(&message.cooked)
            .with_context(|| format!("Failed to parse cooked markup of message {}", message.id))?;
        let mut rendered = Self { message, nodes };

        let mentions: Vec<(String, Option<UserStatus>)> = rendered
            .message
            .mentioned_users
            .iter()
            .map(|mentioned| {
                (
                    mentioned.username.clone(),
                    registry.effective(mentioned.id, mentioned.status.as_ref()),
                )
            })
            .collect();
        for (username, status) in mentions {
            set_mention_badges(&mut rendered.nodes, &username, status.as_ref(), emoji_base_url);
        }

        Ok(rendered)
    }

    pub fn message(&self) -> &ChatMessage {
        &self.message
    }

    pub fn to_html(&self) -> String {
        markup::to_html(&self.nodes)
    }

    /// Every badge currently attached to a mention of `username`.
    pub fn status_badges(&self, username: &str) -> Vec<&Element> {
        let href = mention_href(username);
        markup::find_all(&self.nodes, &|el| is_mention_of(el, &href))
            .into_iter()
            .filter_map(|anchor| anchor.find_descendant(&|el| el.has_class("user-status")))
            .collect()
    }

    fn mentions_user(&self, user_id: UserId) -> bool {
        self.message
            .mentioned_users
            .iter()
            .any(|mentioned| mentioned.id == user_id)
    }

    fn apply_status_change(
        &mut self,
        user_id: UserId,
        status: Option<&UserStatus>,
        emoji_base_url: &str,
    ) {
        let usernames: Vec<String> = self
            .message
            .mentioned_users
            .iter()
            .filter(|mentioned| mentioned.id == user_id)
            .map(|mentioned| mentioned.username.clone())
            .collect();
        for username in usernames {
            set_mention_badges(&mut self.nodes, &username, status, emoji_base_url);
        }
    }
}

/// The rendered state of one chat channel: the ordered message list plus the
/// status registry badges are reconciled against.
pub struct ChannelView {
    channel_id: u64,
    emoji_base_url: String,
    messages: Vec<RenderedMessage>,
    registry: StatusRegistry,
}

impl ChannelView {
    pub fn new(channel_id: u64, emoji_base_url: &str) -> Self {
        Self {
            channel_id,
            emoji_base_url: emoji_base_url.to_string(),
            messages: Vec::new(),
            registry: StatusRegistry::new(),
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Fetch the channel's current messages and render them.
    pub async fn load(&mut self, api: &ChatApiClient) -> Result<()> {
        let response = api.channel_messages(self.channel_id).await?;
        info!(
            "Loaded {} message(s) for channel {}",
            response.chat_messages.len(),
            response.meta.channel_id
        );
        for message in response.chat_messages {
            self.push_message(message)?;
        }
        Ok(())
    }

    /// Render a newly received message and append it to the view. Mentions of
    /// users whose effective status is non-null get a badge immediately.
    pub fn push_message(&mut self, message: ChatMessage) -> Result<()> {
        debug!("Rendering message {}", message.id);
        let rendered = RenderedMessage::render(message, &self.registry, &self.emoji_base_url)?;
        self.messages.push(rendered);
        Ok(())
    }

    pub fn apply_update(&mut self, update: ChannelUpdate) -> Result<()> {
        match update {
            ChannelUpdate::Sent { chat_message } => self.push_message(chat_message),
            ChannelUpdate::Edit { chat_message } => {
                let id = chat_message.id;
                match self.messages.iter().position(|m| m.message.id == id) {
                    Some(index) => {
                        self.messages[index] = RenderedMessage::render(
                            chat_message,
                            &self.registry,
                            &self.emoji_base_url,
                        )?;
                        Ok(())
                    }
                    None => {
                        warn!("Edit for unknown message {id}, ignoring");
                        Ok(())
                    }
                }
            }
            ChannelUpdate::Delete { deleted_id } => {
                let before = self.messages.len();
                self.messages.retain(|m| m.message.id != deleted_id);
                if self.messages.len() == before {
                    warn!("Delete for unknown message {deleted_id}, ignoring");
                }
                Ok(())
            }
        }
    }

    /// Record a `user-status:changed` broadcast and reconcile the badge on
    /// every rendered mention of each affected user. No re-fetch, no full
    /// re-render: only affected mention anchors are touched.
    pub fn apply_status_changes(&mut self, changes: &StatusMap) {
        self.registry.apply(changes);
        for (user_id, status) in changes {
            for rendered in self
                .messages
                .iter_mut()
                .filter(|m| m.mentions_user(*user_id))
            {
                rendered.apply_status_change(*user_id, status.as_ref(), &self.emoji_base_url);
            }
        }
    }

    pub fn messages(&self) -> &[RenderedMessage] {
        &self.messages
    }

    pub fn last_message_id(&self) -> u64 {
        self.messages
            .iter()
            .map(|m| m.message.id)
            .max()
            .unwrap_or(0)
    }

    /// The first badge attached to a mention of `username`, if any.
    pub fn status_badge(&self, username: &str) -> Option<&Element> {
        self.status_badges(username).into_iter().next()
    }

    /// Every badge attached to a mention of `username`, across all messages.
    pub fn status_badges(&self, username: &str) -> Vec<&Element> {
        self.messages
            .iter()
            .flat_map(|m| m.status_badges(username))
            .collect()
    }
}

/// A channel view driven by its bus topics from a spawned task.
///
/// Updates and status broadcasts are applied in arrival order on a single
/// logical event queue; `settle` waits for everything published so far to be
/// applied, so callers can read a deterministic view without sleeping.
pub struct SubscribedView {
    view: Arc<Mutex<ChannelView>>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SubscribedView {
    pub async fn spawn(bus: &MessageBus, view: ChannelView) -> Self {
        let mut updates = bus.subscribe(&chat_topic(view.channel_id())).await;
        let mut statuses = bus.subscribe(USER_STATUS_TOPIC).await;
        let (flush_tx, mut flush_rx) = mpsc::channel::<oneshot::Sender<()>>(16);

        let view = Arc::new(Mutex::new(view));
        let loop_view = view.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(payload) => handle_update(&loop_view, payload).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Channel subscription lagged, {skipped} update(s) dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    change = statuses.recv() => match change {
                        Ok(payload) => handle_status_changes(&loop_view, payload).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Status subscription lagged, {skipped} broadcast(s) dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    request = flush_rx.recv() => match request {
                        Some(ack) => {
                            drain_pending(&loop_view, &mut updates, &mut statuses).await;
                            let _ = ack.send(());
                        }
                        None => break,
                    },
                }
            }
            debug!("Channel subscription loop stopped");
        });

        Self {
            view,
            flush_tx,
            task,
        }
    }

    pub fn view(&self) -> &Arc<Mutex<ChannelView>> {
        &self.view
    }

    /// Wait until every event published before this call has been applied.
    pub async fn settle(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

impl Drop for SubscribedView {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_update(view: &Arc<Mutex<ChannelView>>, payload: Value) {
    let update: ChannelUpdate = match serde_json::from_value(payload) {
        Ok(update) => update,
        Err(e) => {
            warn!("Ignoring malformed channel update: {e}");
            return;
        }
    };
    if let Err(e) = view.lock().await.apply_update(update) {
        warn!("Failed to apply channel update: {e:#}");
    }
}

async fn handle_status_changes(view: &Arc<Mutex<ChannelView>>, payload: Value) {
    let changes: StatusMap = match serde_json::from_value(payload) {
        Ok(changes) => changes,
        Err(e) => {
            warn!("Ignoring malformed status broadcast: {e}");
            return;
        }
    };
    view.lock().await.apply_status_changes(&changes);
}

/// Apply everything already delivered to the subscriptions before a flush is
/// acknowledged, so publish-then-settle observes the published events.
async fn drain_pending(
    view: &Arc<Mutex<ChannelView>>,
    updates: &mut broadcast::Receiver<Value>,
    statuses: &mut broadcast::Receiver<Value>,
) {
    loop {
        match updates.try_recv() {
            Ok(payload) => {
                handle_update(view, payload).await;
                continue;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!("Channel subscription lagged, {skipped} update(s) dropped");
                continue;
            }
            Err(_) => {}
        }
        match statuses.try_recv() {
            Ok(payload) => {
                handle_status_changes(view, payload).await;
                continue;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!("Status subscription lagged, {skipped} broadcast(s) dropped");
                continue;
            }
            Err(_) => {}
        }
        break;
    }
}
