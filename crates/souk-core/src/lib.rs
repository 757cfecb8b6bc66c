pub mod auth;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod listings;
pub mod message;
pub mod notify;
pub mod ordering;

use souk_db::DbPool;
use tokio_util::sync::CancellationToken;

pub use error::CoreError;

/// Worker bits stamped into every snowflake minted by this process.
pub const WORKER_ID: u16 = 1;

/// Gateway tuning. Every knob has a config-file counterpart in
/// `[gateway]`.
#[derive(Clone, Copy, Debug)]
pub struct GatewaySettings {
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this disconnects the client.
    pub heartbeat_timeout_ms: u64,
    pub identify_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub max_connections_per_user: usize,
    pub max_connections_total: usize,
    /// Frames buffered per connection before it is evicted as a slow reader.
    pub outbound_queue: usize,
    pub sends_per_minute: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 41_250,
            heartbeat_timeout_ms: 90_000,
            identify_timeout_ms: 10_000,
            ping_interval_ms: 20_000,
            max_connections_per_user: 5,
            max_connections_total: 2_000,
            outbound_queue: 256,
            sends_per_minute: 120,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    pub gateway: GatewaySettings,
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    /// Room hub: live sessions and the conversations they joined.
    pub event_bus: events::EventBus,
    pub config: AppConfig,
    pub listings: listings::ListingProvider,
    pub notifier: notify::NotificationSink,
    pub append_locks: ordering::ConversationLocks,
    pub send_limiter: dispatch::SendRateLimiter,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        listings: listings::ListingProvider,
        notifier: notify::NotificationSink,
    ) -> Self {
        let gateway = config.gateway;
        Self {
            db,
            event_bus: events::EventBus::new(events::HubLimits {
                max_sessions_per_user: gateway.max_connections_per_user,
                max_sessions_total: gateway.max_connections_total,
                queue_capacity: gateway.outbound_queue,
            }),
            config,
            listings,
            notifier,
            append_locks: ordering::ConversationLocks::default(),
            send_limiter: dispatch::SendRateLimiter::per_minute(gateway.sends_per_minute),
            shutdown: CancellationToken::new(),
        }
    }
}
