//! Path-rewriting passthrough
//!
//! Requests under one configured URL prefix are rewritten to an absolute
//! target and then forwarded through the rotation pool like any other
//! proxied request. The prefix is public: it bypasses client authentication
//! but stays behind the per-client rate limit.

use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Uri};
use url::Url;

use crate::config::PassthroughConfig;
use crate::error::{GyreError, Result};

pub struct PassthroughRewriter {
    prefix: String,
    target: Url,
    host_header: HeaderValue,
}

impl PassthroughRewriter {
    pub fn new(config: &PassthroughConfig) -> Result<Self> {
        let host = config
            .target
            .host_str()
            .ok_or_else(|| GyreError::InvalidConfig("passthrough target missing host".into()))?;

        let authority = match config.target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let host_header = HeaderValue::from_str(&authority)
            .map_err(|e| GyreError::InvalidConfig(format!("passthrough target host: {}", e)))?;

        Ok(Self {
            prefix: config.prefix.trim_matches('/').to_string(),
            target: config.target.clone(),
            host_header,
        })
    }

    /// Whether a request path falls under the rewrite prefix
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix('/') {
            Some(rest) => {
                rest == self.prefix
                    || rest
                        .strip_prefix(&self.prefix)
                        .is_some_and(|tail| tail.starts_with('/'))
            }
            None => false,
        }
    }

    /// Rewrite a matching request in place: absolute target URI, Host header
    pub fn rewrite<B>(&self, req: Request<B>) -> Result<Request<B>> {
        let (mut parts, body) = req.into_parts();

        let path = parts.uri.path();
        let mut remainder = path
            .strip_prefix('/')
            .and_then(|rest| rest.strip_prefix(&self.prefix))
            .unwrap_or("")
            .to_string();
        if remainder.is_empty() {
            remainder = "/".to_string();
        }

        let mut target = format!(
            "{}://{}{}",
            self.target.scheme(),
            self.host_header.to_str().unwrap_or_default(),
            remainder
        );
        if let Some(query) = parts.uri.query() {
            target.push('?');
            target.push_str(query);
        }

        parts.uri = target
            .parse::<Uri>()
            .map_err(|e| GyreError::InvalidRequest(format!("rewritten URI invalid: {}", e)))?;
        parts.headers.insert(HOST, self.host_header.clone());

        Ok(Request::from_parts(parts, body))
    }
}
