mod settings;

pub use settings::{
    DatabaseConfig, OtelConfig, ProviderConfig, ProvidersConfig, QueueOverride, QueueSettings,
    RedisConfig, ServerConfig, Settings, ShutdownSettings, StoreKind,
};
