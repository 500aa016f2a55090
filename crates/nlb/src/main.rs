use std::sync::Arc;

use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use nlb_core::{
    broadcast::{BroadcastConfig, BroadcastEngine},
    config::Config,
    gate::LookupGate,
    grant::{DailyGrantScheduler, GrantConfig},
    lookup::LookupClient,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    quota::QuotaLedger,
    store::{ProtectedRegistry, UserStore},
};
use nlb_lookup::HttpLookupClient;
use nlb_mongo::MongoStore;
use nlb_telegram::{router::AppState, TelegramMessenger};

#[tokio::main]
async fn main() -> Result<(), nlb_core::Error> {
    nlb_core::logging::init("nlb")?;

    let cfg = Arc::new(Config::load()?);

    let mongo = MongoStore::connect(&cfg.mongo_uri, &cfg.mongo_db).await?;
    let store: Arc<dyn UserStore> = Arc::new(mongo.clone());
    let protected: Arc<dyn ProtectedRegistry> = Arc::new(mongo);

    let lookup: Arc<dyn LookupClient> = Arc::new(HttpLookupClient::new(
        cfg.api_url.clone(),
        cfg.api_key.clone(),
        cfg.lookup_timeout,
    )?);

    let bot = Bot::new(cfg.bot_token.clone());
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let ledger = Arc::new(QuotaLedger::new(
        store.clone(),
        cfg.initial_credits,
        cfg.daily_grant_amount,
    ));
    let gate = Arc::new(LookupGate::new(
        ledger.clone(),
        protected.clone(),
        lookup,
    ));
    let engine = BroadcastEngine::new(
        store.clone(),
        messenger.clone(),
        BroadcastConfig {
            per_recipient_delay: cfg.broadcast_delay,
            progress_interval: cfg.progress_interval,
        },
    );

    let scheduler = DailyGrantScheduler::new(
        store.clone(),
        ledger.clone(),
        messenger.clone(),
        GrantConfig {
            hour: cfg.grant_hour,
            minute: cfg.grant_minute,
            amount: cfg.daily_grant_amount,
        },
    );
    let shutdown = CancellationToken::new();
    let grant_task = scheduler.spawn(shutdown.clone());

    let state = Arc::new(AppState {
        cfg,
        store,
        protected,
        ledger,
        gate,
        engine,
        messenger,
    });

    nlb_telegram::router::run_polling(bot, state)
        .await
        .map_err(|e| nlb_core::Error::External(format!("telegram bot failed: {e}")))?;

    info!("shutting down");
    shutdown.cancel();
    let _ = grant_task.await;

    Ok(())
}
