//! Reply rendering (Telegram HTML parse mode).

use crate::broadcast::ProgressSnapshot;
use crate::domain::{CreditBalance, UserId};
use crate::lookup::SubscriberRecord;

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn render_balance(balance: CreditBalance) -> String {
    match balance {
        CreditBalance::Limited(n) => n.to_string(),
        CreditBalance::Unlimited => "Unlimited".to_string(),
    }
}

pub fn render_welcome(user: UserId, balance: CreditBalance) -> String {
    format!(
        "👁 <b>Number Lookup</b>\n\n\
         👤 User ID: <code>{}</code>\n\
         💳 Credits: <code>{}</code>\n\n\
         Send a 10-digit mobile number (without +91) to fetch subscriber details.",
        user.0,
        render_balance(balance)
    )
}

/// Non-empty search result: header plus the cleaned records as a JSON block.
pub fn render_hit(records: &[SubscriberRecord], remaining: CreditBalance) -> String {
    let body = serde_json::to_string_pretty(records).unwrap_or_else(|_| "[]".to_string());
    format!(
        "✅ Search successful\n💳 Remaining credits: {}\n\n<pre>{}</pre>",
        render_balance(remaining),
        escape_html(&body)
    )
}

pub fn render_progress(snap: &ProgressSnapshot) -> String {
    let visited = snap.sent + snap.failed;
    format!(
        "📢 <b>Broadcast {}</b>\n{}\n\
         ✅ sent: {}  ❌ failed: {}  👥 total: {}",
        snap.state.label(),
        progress_bar(visited, snap.total),
        snap.sent,
        snap.failed,
        snap.total,
    )
}

/// Textual completion meter. `total` is an estimate, so the ratio is clamped.
fn progress_bar(done: u64, total: u64) -> String {
    const WIDTH: u64 = 10;
    let total = total.max(1);
    let pct = (done * 100 / total).min(100);
    let filled = (done * WIDTH / total).min(WIDTH);
    let mut bar = String::with_capacity(WIDTH as usize + 8);
    for i in 0..WIDTH {
        bar.push(if i < filled { '▓' } else { '░' });
    }
    format!("{bar} {pct}%")
}
