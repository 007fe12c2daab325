use serde::{Deserialize, Serialize};

/// Complete runtime settings record
///
/// Stored as keyed JSON rows and mutable at runtime; unknown fields in the
/// stored JSON are ignored so collaborator subsystems can extend the record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub rotation: RotationSettings,
    #[serde(default)]
    pub authentication: AuthenticationSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// Upstream rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// Rotation method: random, round-robin, least-conn, time-based, rate-limited
    pub method: String,
    pub time_based: TimeBasedSettings,
    pub rate_limited: RateLimitedSettings,
    /// Drop failed upstreams from the candidate set
    pub remove_unhealthy: bool,
    /// Re-select a different upstream when a dial fails
    pub fallback: bool,
    /// Upstream-switching attempts (at least 1 is always made)
    pub fallback_max_retries: i32,
    /// Engine-level redirect following; off means redirects pass through verbatim
    pub follow_redirect: bool,
    /// Per-attempt deadline in seconds
    pub timeout: i64,
    /// Retries on the same upstream within one attempt
    pub retries: i32,
    /// Protocol filter (empty = all)
    pub allowed_protocols: Vec<String>,
    /// Maximum average response time in milliseconds (0 = no limit)
    pub max_response_time: i32,
    /// Minimum success rate percentage (0-100, 0 = no minimum)
    pub min_success_rate: f64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            method: "random".to_string(),
            time_based: TimeBasedSettings::default(),
            rate_limited: RateLimitedSettings::default(),
            remove_unhealthy: true,
            fallback: true,
            fallback_max_retries: 3,
            follow_redirect: false,
            timeout: 30,
            retries: 2,
            allowed_protocols: vec![],
            max_response_time: 0,
            min_success_rate: 0.0,
        }
    }
}

/// Time-slot rotation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeBasedSettings {
    /// Slot size in seconds
    pub interval: i64,
}

impl Default for TimeBasedSettings {
    fn default() -> Self {
        Self { interval: 120 }
    }
}

/// Rate-limited rotation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitedSettings {
    /// Successful requests allowed per upstream per window
    pub max_requests_per_minute: i64,
    /// Sliding window size in seconds
    pub window_seconds: i64,
}

impl Default for RateLimitedSettings {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 30,
            window_seconds: 60,
        }
    }
}

/// A client credential accepted by the proxy listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyUser {
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
}

/// Client authentication settings for the proxy listener
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthenticationSettings {
    pub enabled: bool,
    pub users: Vec<ProxyUser>,
}

/// Per-client rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// Window in seconds
    pub interval: i64,
    /// Requests allowed per client per window
    pub max_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 60,
            max_requests: 100,
        }
    }
}

/// Settings keys as stored in the settings table
pub mod keys {
    pub const ROTATION: &str = "rotation";
    pub const AUTHENTICATION: &str = "authentication";
    pub const RATE_LIMIT: &str = "rate_limit";
}

/// One versioned settings row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SettingsRecord {
    pub key: String,
    pub value: serde_json::Value,
    pub version: i64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_defaults() {
        let rotation = RotationSettings::default();
        assert_eq!(rotation.method, "random");
        assert_eq!(rotation.time_based.interval, 120);
        assert_eq!(rotation.rate_limited.max_requests_per_minute, 30);
        assert_eq!(rotation.rate_limited.window_seconds, 60);
        assert!(rotation.remove_unhealthy);
        assert!(rotation.fallback);
        assert_eq!(rotation.fallback_max_retries, 3);
        assert!(!rotation.follow_redirect);
        assert_eq!(rotation.timeout, 30);
        assert_eq!(rotation.retries, 2);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let rotation: RotationSettings = serde_json::from_str(
            r#"{"method":"rate-limited","rate_limited":{"max_requests_per_minute":5,"window_seconds":10,"burst":99},"future_knob":true}"#,
        )
        .unwrap();

        assert_eq!(rotation.method, "rate-limited");
        assert_eq!(rotation.rate_limited.max_requests_per_minute, 5);
        assert_eq!(rotation.rate_limited.window_seconds, 10);
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let rotation: RotationSettings = serde_json::from_str(r#"{"method":"round-robin"}"#).unwrap();
        assert_eq!(rotation.method, "round-robin");
        assert_eq!(rotation.timeout, 30);
        assert_eq!(rotation.time_based.interval, 120);

        let settings: Settings = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(settings.rotation.method, "random");
        assert!(!settings.authentication.enabled);
        assert!(!settings.rate_limit.enabled);
    }

    #[test]
    fn test_user_password_is_write_only() {
        let auth = AuthenticationSettings {
            enabled: true,
            users: vec![ProxyUser {
                user: "alice".to_string(),
                password: "secret".to_string(),
            }],
        };

        let value = serde_json::to_value(&auth).unwrap();
        let user = &value["users"][0];
        assert_eq!(user.get("user").and_then(|v| v.as_str()), Some("alice"));
        assert!(user.get("password").is_none());

        let decoded: AuthenticationSettings = serde_json::from_str(
            r#"{"enabled":true,"users":[{"user":"alice","password":"secret"},{"user":"bob"}]}"#,
        )
        .unwrap();
        assert_eq!(decoded.users[0].password, "secret");
        assert_eq!(decoded.users[1].password, "");
    }
}
