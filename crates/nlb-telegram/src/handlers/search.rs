use tracing::warn;

use nlb_core::{
    domain::{ChatId, UserId},
    formatting::render_hit,
    gate::{DenialReason, SearchOutcome},
    messaging::port::MessagingPort,
    Error,
};

use crate::router::AppState;

/// Denial reasons stay distinguishable for the user: no credits, protected,
/// no results and service-down each get their own reply.
pub async fn handle_search(chat: ChatId, user: UserId, raw_term: &str, state: &AppState) {
    let reply = match state.gate.search(user, raw_term).await {
        Ok(SearchOutcome::Hit { records, remaining }) => render_hit(&records, remaining),
        Ok(SearchOutcome::NoResults) => "❌ No data found".to_string(),
        Ok(SearchOutcome::Denied(DenialReason::InvalidTerm)) => {
            "❌ Invalid mobile number".to_string()
        }
        Ok(SearchOutcome::Denied(DenialReason::Protected)) => {
            "🔐 This number is protected and cannot be searched.".to_string()
        }
        Ok(SearchOutcome::Denied(DenialReason::NoCredits)) => {
            "❌ No credits left\n💳 Ask an administrator to top you up, or wait for the daily bonus."
                .to_string()
        }
        Err(Error::Upstream(e)) => {
            warn!(user = user.0, "lookup upstream failed: {e}");
            "⚠️ Lookup service unavailable, try again later. No credit was spent.".to_string()
        }
        Err(e) => {
            warn!(user = user.0, "search failed: {e}");
            "⚠️ Service temporarily unavailable, try again later.".to_string()
        }
    };

    let _ = state.messenger.send_html(chat, &reply).await;
}
