//! Client authentication for the proxy listener
//!
//! Basic credentials in `Proxy-Authorization`, matched against the user list
//! from settings. Passthrough requests and the health endpoint never reach
//! this check.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{GyreError, Result};
use crate::models::AuthenticationSettings;

struct AuthState {
    enabled: bool,
    users: Vec<(String, String)>,
}

/// Proxy client authentication middleware
pub struct ProxyAuth {
    state: RwLock<AuthState>,
}

impl ProxyAuth {
    pub fn new(settings: &AuthenticationSettings) -> Self {
        Self {
            state: RwLock::new(Self::state_from(settings)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&AuthenticationSettings::default())
    }

    fn state_from(settings: &AuthenticationSettings) -> AuthState {
        AuthState {
            enabled: settings.enabled,
            users: settings
                .users
                .iter()
                .map(|u| (u.user.clone(), u.password.clone()))
                .collect(),
        }
    }

    /// Swap in new settings during reload
    pub fn update_settings(&self, settings: &AuthenticationSettings) {
        *self.state.write() = Self::state_from(settings);
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    /// Validate the Proxy-Authorization header against the user list
    pub fn validate<T>(&self, req: &Request<T>) -> Result<()> {
        let state = self.state.read();
        if !state.enabled {
            return Ok(());
        }

        let auth_header = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .ok_or(GyreError::AuthenticationFailed)?;

        let auth_str = auth_header
            .to_str()
            .map_err(|_| GyreError::AuthenticationFailed)?;

        let encoded = auth_str
            .strip_prefix("Basic ")
            .ok_or(GyreError::AuthenticationFailed)?;

        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| GyreError::AuthenticationFailed)?;
        let credentials =
            String::from_utf8(decoded).map_err(|_| GyreError::AuthenticationFailed)?;

        let (user, pass) = credentials
            .split_once(':')
            .ok_or(GyreError::AuthenticationFailed)?;

        if state
            .users
            .iter()
            .any(|(u, p)| u == user && p == pass)
        {
            debug!(user = user, "proxy authentication succeeded");
            Ok(())
        } else {
            warn!(user = user, "proxy authentication failed");
            Err(GyreError::AuthenticationFailed)
        }
    }

    /// 407 response with the Basic challenge
    pub fn challenge_response<T>(&self) -> Response<T>
    where
        T: Default,
    {
        Response::builder()
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(PROXY_AUTHENTICATE, "Basic realm=\"proxy\"")
            .body(T::default())
            .unwrap()
    }
}
