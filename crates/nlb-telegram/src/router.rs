use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tracing::info;

use nlb_core::{
    broadcast::BroadcastEngine, config::Config, gate::LookupGate,
    messaging::port::MessagingPort, quota::QuotaLedger, store::ProtectedRegistry,
    store::UserStore,
};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<dyn UserStore>,
    pub protected: Arc<dyn ProtectedRegistry>,
    pub ledger: Arc<QuotaLedger>,
    pub gate: Arc<LookupGate>,
    pub engine: BroadcastEngine,
    pub messenger: Arc<dyn MessagingPort>,
}

pub async fn run_polling(bot: Bot, state: Arc<AppState>) -> anyhow::Result<()> {
    if let Ok(me) = bot.get_me().await {
        info!("nlb started: @{}", me.username());
    }
    info!("administrators: {}", state.cfg.admin_ids.len());

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
