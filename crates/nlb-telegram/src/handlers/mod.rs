//! Telegram update handlers.
//!
//! Commands are parsed here; everything else that carries text is treated as
//! a search term. The one exception: when a broadcast job is awaiting
//! content, the operator's next message becomes the payload.

use std::sync::Arc;

use teloxide::prelude::*;

use nlb_core::domain::{ChatId, UserId};
use nlb_core::security::is_administrator;

use crate::router::AppState;

mod commands;
mod search;

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = UserId(user.id.0 as i64);
    let chat = ChatId(msg.chat.id.0);

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(msg, state).await;
        }
    }

    if is_administrator(Some(user_id), &state.cfg.admin_ids) {
        if let Some(job) = state.engine.pending_for(chat).await {
            commands::handle_broadcast_content(&msg, &state, job).await;
            return Ok(());
        }
    }

    if let Some(text) = msg.text() {
        search::handle_search(chat, user_id, text, &state).await;
    }

    Ok(())
}
