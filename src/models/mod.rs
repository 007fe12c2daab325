mod record;
mod settings;
mod upstream;

pub use record::{RequestOutcome, RequestRecord};
pub use settings::{
    keys, AuthenticationSettings, ProxyUser, RateLimitSettings, RateLimitedSettings,
    RotationSettings, Settings, SettingsRecord, TimeBasedSettings,
};
pub use upstream::{Upstream, UpstreamProtocol, UpstreamStatus};
