use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use nlb_core::{
    broadcast::{BroadcastPayload, CancelOutcome, JobId, StartOutcome},
    domain::{ChatId, UserId},
    formatting::{escape_html, render_progress, render_welcome},
    messaging::port::MessagingPort,
    security::is_administrator,
    store::{ProtectedRegistry, UserStore},
    term::CanonicalTerm,
};

use crate::router::AppState;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = UserId(user.id.0 as i64);
    let chat = ChatId(msg.chat.id.0);
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let (cmd, args) = parse_command(text);

    match cmd.as_str() {
        "start" => start(chat, user_id, &state).await,
        // Operator commands are silently ignored for everyone else.
        _ if !is_administrator(Some(user_id), &state.cfg.admin_ids) => {}
        "add" => adjust(chat, &state, &args, 1).await,
        "remove" => adjust(chat, &state, &args, -1).await,
        "unlimited" => unlimited(chat, &state, &args).await,
        "protect" => protect(chat, &state, &args, true).await,
        "unprotect" => protect(chat, &state, &args, false).await,
        "protected" => protected_list(chat, &state).await,
        "broadcast" => broadcast(chat, &state, &args).await,
        "cancel" => cancel(chat, &state).await,
        "status" => status(chat, &state).await,
        _ => {}
    }

    Ok(())
}

async fn send(state: &AppState, chat: ChatId, text: &str) {
    let _ = state.messenger.send_html(chat, text).await;
}

async fn start(chat: ChatId, user: UserId, state: &AppState) {
    match state
        .store
        .create_if_absent(user, state.ledger.initial_credits())
        .await
    {
        Ok(rec) => send(state, chat, &render_welcome(user, rec.balance())).await,
        Err(e) => {
            warn!(user = user.0, "start failed: {e}");
            send(state, chat, "⚠️ Service temporarily unavailable, try again later.").await;
        }
    }
}

fn parse_user_and_amount(args: &str) -> Option<(i64, i64)> {
    let mut parts = args.split_whitespace();
    let target = parts.next()?.parse::<i64>().ok()?;
    let amount = parts.next()?.parse::<i64>().ok()?;
    (amount > 0 && parts.next().is_none()).then_some((target, amount))
}

async fn adjust(chat: ChatId, state: &AppState, args: &str, sign: i64) {
    let Some((target, amount)) = parse_user_and_amount(args) else {
        let usage = if sign > 0 {
            "Usage: /add &lt;user_id&gt; &lt;credits&gt;"
        } else {
            "Usage: /remove &lt;user_id&gt; &lt;credits&gt;"
        };
        send(state, chat, usage).await;
        return;
    };

    match state.ledger.adjust_credits(UserId(target), sign * amount).await {
        Ok(()) => {
            let verb = if sign > 0 { "added" } else { "removed" };
            send(state, chat, &format!("✅ Credits {verb}")).await;
        }
        Err(e) => {
            warn!(user = target, "credit adjustment failed: {e}");
            send(state, chat, "⚠️ Store unavailable, nothing changed.").await;
        }
    }
}

async fn unlimited(chat: ChatId, state: &AppState, args: &str) {
    let mut parts = args.split_whitespace();
    let target = parts.next().and_then(|s| s.parse::<i64>().ok());
    let switch = match parts.next() {
        Some("on") => Some(true),
        Some("off") => Some(false),
        _ => None,
    };
    let (Some(target), Some(on)) = (target, switch) else {
        send(state, chat, "Usage: /unlimited &lt;user_id&gt; on|off").await;
        return;
    };

    match state.ledger.set_unlimited(UserId(target), on).await {
        Ok(()) => {
            let reply = if on {
                "✅ Unlimited enabled"
            } else {
                "❌ Unlimited disabled"
            };
            send(state, chat, reply).await;
        }
        Err(e) => {
            warn!(user = target, "unlimited toggle failed: {e}");
            send(state, chat, "⚠️ Store unavailable, nothing changed.").await;
        }
    }
}

async fn protect(chat: ChatId, state: &AppState, args: &str, adding: bool) {
    let Some(term) = CanonicalTerm::parse(args) else {
        let usage = if adding {
            "Usage: /protect &lt;number&gt;"
        } else {
            "Usage: /unprotect &lt;number&gt;"
        };
        send(state, chat, usage).await;
        return;
    };

    let result = if adding {
        state.protected.add(term.as_str()).await
    } else {
        state.protected.remove(term.as_str()).await
    };

    let reply = match (result, adding) {
        (Ok(true), true) => "🔐 Number protected".to_string(),
        (Ok(false), true) => "🔐 Number was already protected".to_string(),
        (Ok(true), false) => "🔓 Number unprotected".to_string(),
        (Ok(false), false) => "🔓 Number was not protected".to_string(),
        (Err(e), _) => {
            warn!("protection registry update failed: {e}");
            "⚠️ Store unavailable, nothing changed.".to_string()
        }
    };
    send(state, chat, &reply).await;
}

async fn protected_list(chat: ChatId, state: &AppState) {
    match state.protected.list().await {
        Ok(terms) if terms.is_empty() => send(state, chat, "No protected numbers.").await,
        Ok(terms) => {
            let body = terms
                .iter()
                .map(|t| format!("• <code>{}</code>", escape_html(t)))
                .collect::<Vec<_>>()
                .join("\n");
            send(state, chat, &format!("🔐 <b>Protected numbers</b>\n{body}")).await;
        }
        Err(e) => {
            warn!("protection registry list failed: {e}");
            send(state, chat, "⚠️ Store unavailable.").await;
        }
    }
}

async fn broadcast(chat: ChatId, state: &AppState, args: &str) {
    match state.engine.start(chat).await {
        Ok(StartOutcome::Started(job)) => {
            if args.trim().is_empty() {
                send(
                    state,
                    chat,
                    "📢 Send the broadcast content now (text or photo). /cancel to abort.",
                )
                .await;
            } else {
                // Shorthand: `/broadcast <text>` starts and supplies in one step.
                state
                    .engine
                    .supply_content(job, BroadcastPayload::Text(escape_html(args)))
                    .await;
            }
        }
        Ok(StartOutcome::Refused) => {
            send(
                state,
                chat,
                "⚠️ A broadcast is already active. /status for progress, /cancel to abort.",
            )
            .await;
        }
        Err(e) => {
            warn!("broadcast start failed: {e}");
            send(state, chat, "⚠️ Store unavailable, broadcast not started.").await;
        }
    }
}

pub(crate) async fn handle_broadcast_content(msg: &Message, state: &AppState, job: JobId) {
    let chat = ChatId(msg.chat.id.0);

    let payload = if let Some(text) = msg.text() {
        Some(BroadcastPayload::Text(escape_html(text)))
    } else if let Some(photos) = msg.photo() {
        photos.last().map(|p| BroadcastPayload::Photo {
            file_id: p.file.id.clone(),
            caption: msg.caption().map(escape_html),
        })
    } else {
        None
    };

    let Some(payload) = payload else {
        send(
            state,
            chat,
            "Send text or a single photo for the broadcast, or /cancel.",
        )
        .await;
        return;
    };

    if !state.engine.supply_content(job, payload).await {
        send(state, chat, "⚠️ Broadcast is no longer awaiting content.").await;
    }
}

async fn cancel(chat: ChatId, state: &AppState) {
    let reply = match state.engine.cancel().await {
        CancelOutcome::CancelledPending => "🚫 Pending broadcast cancelled.",
        CancelOutcome::CancelledRunning => {
            "🚫 Broadcast cancelled; delivery stops after the current recipient."
        }
        CancelOutcome::NoActiveJob => "No active broadcast.",
    };
    send(state, chat, reply).await;
}

async fn status(chat: ChatId, state: &AppState) {
    let reply = match state.engine.status().await {
        Some(snap) => render_progress(&snap),
        None => "No broadcast has run yet.".to_string(),
    };
    send(state, chat, &reply).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing_strips_bot_suffix_and_lowercases() {
        assert_eq!(
            parse_command("/Broadcast@nlb_bot hello world"),
            ("broadcast".to_string(), "hello world".to_string())
        );
        assert_eq!(parse_command("/start"), ("start".to_string(), String::new()));
    }

    #[test]
    fn user_and_amount_parsing_rejects_junk() {
        assert_eq!(parse_user_and_amount("42 3"), Some((42, 3)));
        assert_eq!(parse_user_and_amount("42 -3"), None);
        assert_eq!(parse_user_and_amount("42"), None);
        assert_eq!(parse_user_and_amount("42 3 extra"), None);
        assert_eq!(parse_user_and_amount("abc 3"), None);
    }
}
