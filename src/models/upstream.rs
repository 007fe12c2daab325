use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::RotationSettings;

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    Http,
    Https,
    Socks5,
}

impl UpstreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamProtocol::Http => "http",
            UpstreamProtocol::Https => "https",
            UpstreamProtocol::Socks5 => "socks5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(UpstreamProtocol::Http),
            "https" => Some(UpstreamProtocol::Https),
            "socks5" => Some(UpstreamProtocol::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, UpstreamProtocol::Socks5)
    }
}

impl std::fmt::Display for UpstreamProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Upstream lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    #[default]
    Idle,
    Active,
    Failed,
}

impl UpstreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamStatus::Idle => "idle",
            UpstreamStatus::Active => "active",
            UpstreamStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(UpstreamStatus::Idle),
            "active" => Some(UpstreamStatus::Active),
            "failed" => Some(UpstreamStatus::Failed),
            _ => None,
        }
    }

    /// Whether an upstream in this status may enter the candidate set
    pub fn is_selectable(&self) -> bool {
        matches!(self, UpstreamStatus::Idle | UpstreamStatus::Active)
    }
}

impl std::fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An addressable proxy endpoint in the rotation pool
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Upstream {
    pub id: i64,
    /// host:port
    pub address: String,
    pub protocol: UpstreamProtocol,
    #[serde(skip_serializing)]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub status: UpstreamStatus,
    pub requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub avg_response_time_ms: i32,
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upstream {
    /// Lifetime success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.successful_requests as f64 / self.requests as f64) * 100.0
        }
    }

    pub fn is_selectable(&self) -> bool {
        self.status.is_selectable()
    }

    /// Rotation filters beyond status: protocol, response time, success rate.
    /// The success-rate filter only applies once the upstream has history.
    pub fn passes_filters(&self, settings: &RotationSettings) -> bool {
        if !settings.allowed_protocols.is_empty()
            && !settings
                .allowed_protocols
                .iter()
                .any(|p| p.eq_ignore_ascii_case(self.protocol.as_str()))
        {
            return false;
        }

        if settings.max_response_time > 0 && self.avg_response_time_ms > settings.max_response_time {
            return false;
        }

        if settings.min_success_rate > 0.0
            && self.requests > 0
            && self.success_rate() < settings.min_success_rate
        {
            return false;
        }

        true
    }

    /// `Proxy-Authorization` value for this upstream's credentials, if any
    pub fn basic_credentials(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                let encoded = BASE64.encode(format!("{}:{}", user, pass));
                Some(format!("Basic {}", encoded))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_upstream(id: i64) -> Upstream {
        Upstream {
            id,
            address: format!("127.0.0.1:{}", 8000 + id),
            protocol: UpstreamProtocol::Http,
            username: None,
            password: None,
            status: UpstreamStatus::Idle,
            requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_response_time_ms: 0,
            last_check_at: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!(UpstreamProtocol::parse("HTTP"), Some(UpstreamProtocol::Http));
        assert_eq!(
            UpstreamProtocol::parse("https"),
            Some(UpstreamProtocol::Https)
        );
        assert_eq!(
            UpstreamProtocol::parse("SOCKS5"),
            Some(UpstreamProtocol::Socks5)
        );
        assert_eq!(UpstreamProtocol::parse("socks4"), None);

        assert!(UpstreamProtocol::Socks5.is_socks());
        assert!(!UpstreamProtocol::Https.is_socks());
        assert_eq!(UpstreamProtocol::Socks5.to_string(), "socks5");
    }

    #[test]
    fn test_status_parsing_and_selectable() {
        assert_eq!(UpstreamStatus::parse("idle"), Some(UpstreamStatus::Idle));
        assert_eq!(UpstreamStatus::parse("ACTIVE"), Some(UpstreamStatus::Active));
        assert_eq!(UpstreamStatus::parse("failed"), Some(UpstreamStatus::Failed));
        assert_eq!(UpstreamStatus::parse("unknown"), None);

        assert!(UpstreamStatus::Idle.is_selectable());
        assert!(UpstreamStatus::Active.is_selectable());
        assert!(!UpstreamStatus::Failed.is_selectable());
    }

    #[test]
    fn test_success_rate() {
        let mut upstream = base_upstream(1);
        assert_eq!(upstream.success_rate(), 0.0);

        upstream.requests = 10;
        upstream.successful_requests = 7;
        upstream.failed_requests = 3;
        assert!((upstream.success_rate() - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_passes_filters() {
        let mut upstream = base_upstream(1);
        upstream.avg_response_time_ms = 200;
        upstream.requests = 10;
        upstream.successful_requests = 5;
        upstream.failed_requests = 5;

        let mut settings = RotationSettings::default();
        assert!(upstream.passes_filters(&settings));

        settings.allowed_protocols = vec!["http".to_string()];
        assert!(upstream.passes_filters(&settings));

        settings.allowed_protocols = vec!["socks5".to_string()];
        assert!(!upstream.passes_filters(&settings));

        settings.allowed_protocols.clear();
        settings.max_response_time = 100;
        assert!(!upstream.passes_filters(&settings));

        settings.max_response_time = 0;
        settings.min_success_rate = 60.0;
        assert!(!upstream.passes_filters(&settings));
    }

    #[test]
    fn test_success_rate_filter_ignores_fresh_upstreams() {
        let upstream = base_upstream(1);

        let settings = RotationSettings {
            min_success_rate: 99.0,
            ..RotationSettings::default()
        };

        // No history yet, so the rate filter must not exclude it.
        assert!(upstream.passes_filters(&settings));
    }

    #[test]
    fn test_filter_tightening_never_enlarges_the_set() {
        let mut pool = Vec::new();
        for i in 0..20 {
            let mut u = base_upstream(i);
            u.avg_response_time_ms = (i as i32) * 50;
            u.requests = 10;
            u.successful_requests = i % 11;
            u.failed_requests = u.requests - u.successful_requests;
            pool.push(u);
        }

        let loose = RotationSettings {
            max_response_time: 800,
            min_success_rate: 20.0,
            ..RotationSettings::default()
        };
        let tight = RotationSettings {
            max_response_time: 400,
            min_success_rate: 50.0,
            ..RotationSettings::default()
        };

        let loose_set: Vec<i64> = pool
            .iter()
            .filter(|u| u.passes_filters(&loose))
            .map(|u| u.id)
            .collect();
        let tight_set: Vec<i64> = pool
            .iter()
            .filter(|u| u.passes_filters(&tight))
            .map(|u| u.id)
            .collect();

        assert!(tight_set.len() <= loose_set.len());
        assert!(tight_set.iter().all(|id| loose_set.contains(id)));
    }

    #[test]
    fn test_basic_credentials() {
        let mut upstream = base_upstream(1);
        assert!(upstream.basic_credentials().is_none());

        upstream.username = Some("user".to_string());
        assert!(upstream.basic_credentials().is_none());

        upstream.password = Some("pass".to_string());
        let header = upstream.basic_credentials().unwrap();
        assert!(header.starts_with("Basic "));

        let decoded = BASE64.decode(header.trim_start_matches("Basic ")).unwrap();
        assert_eq!(decoded, b"user:pass");
    }
}
