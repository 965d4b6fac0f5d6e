use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::Parser;
use realtime::{
    load_settings, spawn_cache_sync, ConnectionManager, Credentials, LiveCache, StaticCredentials,
};
use shared::domain::{ConversationId, WorkspaceId};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Follows a workspace inbox over the realtime broker and keeps a local
/// page cache in sync.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "INBOX_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long)]
    subscriber: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let settings = load_settings(args.config.as_deref())?;
    let credentials = Arc::new(StaticCredentials::new(Credentials {
        identity_token: args.token,
        workspace_id: args.workspace.map(WorkspaceId),
        subscriber_key: args.subscriber,
    }));

    // No REST history here, so live messages start their own collections.
    let cache = Arc::new(LiveCache::new(settings.page_size)?.seed_unloaded_conversations(true));
    let manager = ConnectionManager::new(settings, credentials);
    let mut status = manager.status();
    let mut applied = cache.applied();
    let sync = spawn_cache_sync(manager.subscribe_payloads(), Arc::clone(&cache));

    manager.start().await?;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("inbox: interrupted, shutting down");
                break Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *status.borrow_and_update();
                info!(status = ?current, "inbox: connection status");
                if current.is_terminal() {
                    break Err(anyhow!("broker rejected the credentials; refresh the token"));
                }
            }
            changed = applied.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let latest = *applied.borrow_and_update();
                if let Some(conversation_id) = latest {
                    log_page_shape(&cache, conversation_id).await;
                }
            }
        }
    };

    manager.stop().await;
    sync.abort();
    outcome
}

async fn log_page_shape(cache: &LiveCache, conversation_id: ConversationId) {
    let message_pages = cache
        .messages(conversation_id)
        .await
        .map(|pages| pages.pages.iter().map(|page| page.items.len()).collect::<Vec<_>>())
        .unwrap_or_default();
    let conversations = cache.conversations().await;
    info!(
        conversation_id = conversation_id.0,
        message_pages = ?message_pages,
        conversations = conversations.total_items(),
        conversation_pages = conversations.pages.len(),
        "inbox: payload applied"
    );
}
