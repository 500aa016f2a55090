use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric). Equal to the user id for direct chats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a sent message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl UserId {
    /// The direct chat with this user.
    pub fn chat(self) -> ChatId {
        ChatId(self.0)
    }
}

/// Per-user quota state, one record per distinct user.
///
/// `credits` is only ever mutated through the quota ledger; `last_grant_date`
/// advances in the same atomic store operation as the grant it accompanies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub credits: i64,
    pub unlimited: bool,
    pub last_grant_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn balance(&self) -> CreditBalance {
        if self.unlimited {
            CreditBalance::Unlimited
        } else {
            CreditBalance::Limited(self.credits)
        }
    }
}

/// A user's effective balance as shown to them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreditBalance {
    Limited(i64),
    Unlimited,
}
