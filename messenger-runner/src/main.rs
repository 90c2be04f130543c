use anyhow::Result;
use messenger_api::{AppState, JwtValidator};
use messenger_bus::{Channel, EventBus, RedisEventBus};
use messenger_chat::{run_inbound, BrokerPushSignals, ChatServices, ConnectionRegistry, Dispatcher, Fanout};
use messenger_core::storage::PgStorage;
use messenger_core::{Config, MessengerContext, Storage};
use messenger_presence::{RedisPresence, RedisReplayGuard, RedisUnreadCounters};
use messenger_push::{PushDispatcher, SubscriptionService, WebPushTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting messenger server");

    // Load configuration
    let config = Config::from_env();
    let ctx = MessengerContext::new(config).await?;

    tracing::info!("Messenger context initialized (process {})", ctx.process_id);

    let (bus, inbound, _listener) =
        RedisEventBus::start(ctx.process_id, ctx.redis_pool.clone(), ctx.redis.clone(), ctx.cache_retry());
    let bus: Arc<dyn EventBus> = Arc::new(bus);
    bus.subscribe(Channel::Broadcast).await?;

    let config = ctx.config.clone();
    let storage: Arc<dyn Storage> = Arc::new(PgStorage::new(ctx.db_pool.clone()));
    let presence = Arc::new(RedisPresence::new(ctx.redis.clone(), ctx.cache_retry(), &config.presence));
    let counters = Arc::new(RedisUnreadCounters::new(
        ctx.redis.clone(),
        ctx.cache_retry(),
        bus.clone(),
        &config.counters,
    ));
    let replay = Arc::new(RedisReplayGuard::new(
        ctx.redis.clone(),
        ctx.cache_retry(),
        Duration::from_secs(config.chat.receipt_replay_ttl_secs),
    ));

    let registry = Arc::new(ConnectionRegistry::new(bus.clone(), presence.clone()));
    let fanout = Arc::new(Fanout::new(
        registry.clone(),
        bus.clone(),
        presence.clone(),
        storage.clone(),
        Arc::new(BrokerPushSignals::new(ctx.redpanda_producer.clone())),
    ));
    let services = ChatServices {
        storage: storage.clone(),
        presence: presence.clone(),
        counters: counters.clone(),
        replay,
        settings: config.chat.clone(),
    };
    let dispatcher = Arc::new(Dispatcher::new(services, fanout));

    // Bus events for connections held by this process
    tokio::spawn(run_inbound(registry.clone(), inbound));

    let transport = WebPushTransport::new(&config.push)?;
    let push_dispatcher = PushDispatcher::new(storage.clone(), Arc::new(transport), config.push.clone());
    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = messenger_push::consumer::run(ctx_clone, push_dispatcher).await {
            tracing::error!("Push consumer error: {}", e);
        }
    });

    let reaper_storage = storage.clone();
    let push_config = config.push.clone();
    tokio::spawn(async move {
        if let Err(e) = messenger_push::reaper::run(reaper_storage, push_config).await {
            tracing::error!("Push subscription reaper error: {}", e);
        }
    });

    let state = AppState {
        validator: Arc::new(JwtValidator::new(config.server.jwt_secret.clone())),
        registry,
        dispatcher,
        counters,
        storage: storage.clone(),
        subscriptions: SubscriptionService::new(storage),
        redis: Some(ctx.redis.clone()),
    };

    // API server runs in main task
    tokio::select! {
        result = messenger_api::run(state, &config.server) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
