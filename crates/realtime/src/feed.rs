//! Keeps locally cached pages in step with live payloads.

use std::{collections::HashMap, sync::Arc};

use page_cache::{reflow_insert, Page, PagedCollection, ReflowError, ReflowOptions};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{ConversationSummary, InboundPayload, MessageItem},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub type MessagePages = PagedCollection<Page<MessageItem>>;
pub type ConversationPages = PagedCollection<Page<ConversationSummary>>;

/// Message pages per conversation plus the conversation list, each swapped
/// wholesale under its own lock.
pub struct LiveCache {
    page_size: usize,
    seed_unloaded_conversations: bool,
    messages: Mutex<HashMap<ConversationId, Arc<MessagePages>>>,
    conversations: Mutex<Arc<ConversationPages>>,
    applied: watch::Sender<Option<ConversationId>>,
}

impl LiveCache {
    pub fn new(page_size: usize) -> Result<Self, ReflowError> {
        if page_size == 0 {
            return Err(ReflowError::ZeroPageSize);
        }
        Ok(Self {
            page_size,
            seed_unloaded_conversations: false,
            messages: Mutex::new(HashMap::new()),
            conversations: Mutex::new(Arc::new(PagedCollection::default())),
            applied: watch::channel(None).0,
        })
    }

    /// Start message collections for conversations that were never loaded.
    pub fn seed_unloaded_conversations(mut self, enabled: bool) -> Self {
        self.seed_unloaded_conversations = enabled;
        self
    }

    pub async fn seed_messages(
        &self,
        conversation_id: ConversationId,
        pages: Vec<Page<MessageItem>>,
    ) -> Result<(), ReflowError> {
        let collection = PagedCollection::from_pages(pages, self.page_size)?;
        collection.validate(self.page_size)?;
        self.messages
            .lock()
            .await
            .insert(conversation_id, Arc::new(collection));
        Ok(())
    }

    pub async fn seed_conversations(
        &self,
        pages: Vec<Page<ConversationSummary>>,
    ) -> Result<(), ReflowError> {
        let collection = PagedCollection::from_pages(pages, self.page_size)?;
        collection.validate(self.page_size)?;
        *self.conversations.lock().await = Arc::new(collection);
        Ok(())
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Option<Arc<MessagePages>> {
        self.messages.lock().await.get(&conversation_id).cloned()
    }

    pub async fn conversations(&self) -> Arc<ConversationPages> {
        Arc::clone(&*self.conversations.lock().await)
    }

    /// Conversation of the most recent payload applied. Changes only after
    /// both the message pages and the conversation list reflect it.
    pub fn applied(&self) -> watch::Receiver<Option<ConversationId>> {
        self.applied.subscribe()
    }

    pub async fn apply_payload(&self, payload: &InboundPayload) -> Result<(), ReflowError> {
        self.apply_messages(payload).await?;
        self.apply_conversation(payload).await?;
        self.applied.send_replace(Some(payload.conversation_id));
        Ok(())
    }

    async fn apply_messages(&self, payload: &InboundPayload) -> Result<(), ReflowError> {
        let options = ReflowOptions::new(self.page_size)
            .create_if_empty(self.seed_unloaded_conversations);

        let mut messages = self.messages.lock().await;
        let existing: Arc<MessagePages> = messages
            .get(&payload.conversation_id)
            .cloned()
            .unwrap_or_default();
        let updated = reflow_insert(existing.as_ref(), &payload.messages, &options, |item| {
            item.id
        })?;
        if updated.is_empty() {
            debug!(
                conversation_id = payload.conversation_id.0,
                "realtime: conversation not loaded, messages skipped"
            );
            return Ok(());
        }
        messages.insert(payload.conversation_id, Arc::new(updated));
        Ok(())
    }

    async fn apply_conversation(&self, payload: &InboundPayload) -> Result<(), ReflowError> {
        let mut conversations = self.conversations.lock().await;
        let summary = match &payload.conversation {
            Some(summary) => summary.clone(),
            None => match bump_known(&conversations, payload) {
                Some(summary) => summary,
                None => return Ok(()),
            },
        };

        let current: &ConversationPages = &conversations;
        let options = ReflowOptions::new(self.page_size);
        let updated = reflow_insert(current, &[summary], &options, |summary| summary.id)?;
        *conversations = Arc::new(updated);
        Ok(())
    }
}

/// Without a summary the conversation is only moved up if it is already
/// listed, with its preview and unread count refreshed.
fn bump_known(
    conversations: &ConversationPages,
    payload: &InboundPayload,
) -> Option<ConversationSummary> {
    let latest = payload.messages.first()?;
    let mut summary = conversations
        .iter_items()
        .find(|summary| summary.id == payload.conversation_id)?
        .clone();

    let already_seen: Option<MessageId> = summary.last_message.as_ref().map(|message| message.id);
    let unseen = payload
        .messages
        .iter()
        .take_while(|message| Some(message.id) != already_seen)
        .count();
    summary.unread_count = summary.unread_count.saturating_add(unseen as u32);
    if latest.sent_at > summary.updated_at {
        summary.updated_at = latest.sent_at;
    }
    summary.last_message = Some(latest.clone());
    Some(summary)
}

/// Drains `receiver` into `cache` until the sender side goes away.
pub fn spawn_cache_sync(
    mut receiver: broadcast::Receiver<InboundPayload>,
    cache: Arc<LiveCache>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(payload) => {
                    if let Err(err) = cache.apply_payload(&payload).await {
                        warn!(
                            conversation_id = payload.conversation_id.0,
                            "realtime: cache reflow rejected payload: {err}"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "realtime: cache sync lagged, payloads skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("realtime: payload channel closed, cache sync finished");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
