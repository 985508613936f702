//! Reachability checks against GNS3 controllers.

use crate::client::{ApiClient, Endpoint};
use crate::document::{PROTOCOLS, normalize};
use crate::error::{ClusterError, Result};
use crate::keyring::{KeyEntry, Keyring};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};
use url::Url;

/// A controller address in `scheme://host:port` form with an explicit port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerUrl {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ControllerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl FromStr for ControllerUrl {
    type Err = ClusterError;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = |why: &str| ClusterError::validation(format!("invalid URL `{raw}`: {why}"));
        let parsed = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;

        let protocol = parsed.scheme().to_string();
        if !PROTOCOLS.contains(&protocol.as_str()) {
            return Err(invalid("scheme must be http or https"));
        }
        let host = parsed
            .host_str()
            .map(normalize)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        // `Url::port` hides a port equal to the scheme default, so look at the
        // authority text to tell `http://h:80` from `http://h`.
        let port = match parsed.port() {
            Some(port) => port,
            None if has_explicit_port(raw) => parsed.port_or_known_default().unwrap_or(0),
            None => return Err(invalid("expected scheme://host:port")),
        };
        if port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        Ok(Self {
            protocol,
            host,
            port,
        })
    }
}

fn has_explicit_port(raw: &str) -> bool {
    let authority = raw
        .split_once("://")
        .map_or(raw, |(_, rest)| rest)
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit(['@', ']']).next().unwrap_or_default();
    host_port.contains(':')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable,
    Unauthorized,
}

/// One authenticated `GET /v3/access/users/me`.
///
/// Transport errors and any non-2xx other than 401 count as unreachable.
pub fn probe_controller(url: &ControllerUrl, token: &str, verify_tls: bool) -> ProbeOutcome {
    let client = match ApiClient::new(&url.to_string(), verify_tls) {
        Ok(client) => client.with_token(token),
        Err(err) => {
            debug!(%url, error = %err, "could not build client");
            return ProbeOutcome::Unreachable;
        }
    };
    match client.call(Endpoint::Me, Option::<&Value>::None) {
        Ok(response) if response.is_success() => ProbeOutcome::Reachable,
        Ok(response) if response.status == 401 => ProbeOutcome::Unauthorized,
        Ok(response) => {
            debug!(%url, status = response.status, "controller answered with an error");
            ProbeOutcome::Unreachable
        }
        Err(err) => {
            debug!(%url, error = %format!("{err:#}"), "probe failed");
            ProbeOutcome::Unreachable
        }
    }
}

/// Checks that a controller is usable before anything referencing it is written.
pub trait Probe {
    fn probe(&self, url: &ControllerUrl) -> Result<()>;
}

/// Probes real controllers, using tokens from the keyring.
///
/// When a controller has no token and credentials were given, it logs in
/// first and records the new token.
pub struct ControllerProbe {
    keyring: Mutex<Keyring>,
    verify_tls: bool,
    credentials: Option<(String, String)>,
}

impl ControllerProbe {
    pub fn new(keyring: Keyring, verify_tls: bool) -> Self {
        Self {
            keyring: Mutex::new(keyring),
            verify_tls,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.credentials = user.zip(password);
        self
    }

    fn token_for(&self, url: &ControllerUrl) -> Result<String> {
        let server = url.to_string();
        let known = self
            .keyring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .token_for(&server)
            .map(str::to_string);
        if let Some(token) = known {
            return Ok(token);
        }

        let Some((user, password)) = &self.credentials else {
            return Err(ClusterError::NoToken { url: server });
        };
        let token = ApiClient::new(&server, self.verify_tls)
            .and_then(|client| client.authenticate(user, password))
            .map_err(|err| {
                if err.downcast_ref::<reqwest::Error>().is_some() {
                    ClusterError::Unreachable { url: server.clone() }
                } else {
                    ClusterError::Unauthorized { url: server.clone() }
                }
            })?;
        info!(url = %server, user = %user, "authenticated");

        self.keyring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .upsert(KeyEntry {
                server_url: server,
                user: user.clone(),
                access_token: token.access_token.clone(),
                token_type: token.token_type,
            })?;
        Ok(token.access_token)
    }
}

impl Probe for ControllerProbe {
    fn probe(&self, url: &ControllerUrl) -> Result<()> {
        let token = self.token_for(url)?;
        match probe_controller(url, &token, self.verify_tls) {
            ProbeOutcome::Reachable => {
                debug!(%url, "controller reachable");
                Ok(())
            }
            ProbeOutcome::Unreachable => Err(ClusterError::Unreachable {
                url: url.to_string(),
            }),
            ProbeOutcome::Unauthorized => Err(ClusterError::Unauthorized {
                url: url.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::net::TcpListener;
    use tempfile::tempdir;

    fn url_of(server: &MockServer) -> ControllerUrl {
        server.base_url().parse().unwrap()
    }

    #[test]
    fn parses_controller_urls() {
        let url: ControllerUrl = " HTTPS://Lab1.Example:3080 ".parse().unwrap();
        assert_eq!(url.protocol, "https");
        assert_eq!(url.host, "lab1.example");
        assert_eq!(url.port, 3080);
        assert_eq!(url.to_string(), "https://lab1.example:3080");

        let default_port: ControllerUrl = "http://h:80".parse().unwrap();
        assert_eq!(default_port.port, 80);
    }

    #[test]
    fn rejects_bad_urls() {
        for raw in ["h1:3080", "ftp://h1:21", "http://h1", "http://h1:0", "http://h1:99999", "http://:80"] {
            let err = raw.parse::<ControllerUrl>().unwrap_err();
            assert!(matches!(err, ClusterError::Validation(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn reachable_controller() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/v3/access/users/me")
                .header("Authorization", "Bearer t");
            then.status(200).json_body(json!({"username": "admin"}));
        });
        assert_eq!(probe_controller(&url_of(&server), "t", true), ProbeOutcome::Reachable);
    }

    #[test]
    fn unauthorized_controller() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v3/access/users/me");
            then.status(401);
        });
        assert_eq!(
            probe_controller(&url_of(&server), "stale", true),
            ProbeOutcome::Unauthorized
        );
    }

    #[test]
    fn server_error_counts_as_unreachable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v3/access/users/me");
            then.status(500);
        });
        assert_eq!(probe_controller(&url_of(&server), "t", true), ProbeOutcome::Unreachable);
    }

    #[test]
    fn closed_port_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url: ControllerUrl = format!("http://127.0.0.1:{port}").parse().unwrap();
        assert_eq!(probe_controller(&url, "t", true), ProbeOutcome::Unreachable);
    }

    #[test]
    fn missing_token_without_credentials() {
        let tmp = tempdir().unwrap();
        let prober = ControllerProbe::new(Keyring::open(tmp.path().join("gns3key")).unwrap(), true);
        let url: ControllerUrl = "http://127.0.0.1:3080".parse().unwrap();
        let err = prober.probe(&url).unwrap_err();
        assert!(matches!(err, ClusterError::NoToken { .. }), "{err}");
    }

    #[test]
    fn logs_in_and_records_token_when_missing() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(POST).path("/v3/access/users/authenticate");
            then.status(200)
                .json_body(json!({"access_token": "fresh", "token_type": "bearer"}));
        });
        let me = server.mock(|when, then| {
            when.method(GET)
                .path("/v3/access/users/me")
                .header("Authorization", "Bearer fresh");
            then.status(200).json_body(json!({}));
        });
        let tmp = tempdir().unwrap();
        let key_path = tmp.path().join("gns3key");
        let prober = ControllerProbe::new(Keyring::open(&key_path).unwrap(), true)
            .with_credentials(Some("admin".into()), Some("pw".into()));

        prober.probe(&url_of(&server)).unwrap();

        login.assert();
        me.assert();
        let saved = Keyring::open(&key_path).unwrap();
        assert_eq!(saved.token_for(&server.base_url()), Some("fresh"));
        assert_eq!(saved.entries()[0].user, "admin");
    }

    #[test]
    fn uses_stored_token_without_logging_in() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(POST).path("/v3/access/users/authenticate");
            then.status(200).json_body(json!({"access_token": "x"}));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/v3/access/users/me")
                .header("Authorization", "Bearer stored");
            then.status(200);
        });
        let tmp = tempdir().unwrap();
        let mut ring = Keyring::open(tmp.path().join("gns3key")).unwrap();
        ring.upsert(KeyEntry {
            server_url: server.base_url(),
            user: "admin".into(),
            access_token: "stored".into(),
            token_type: "bearer".into(),
        })
        .unwrap();
        let prober = ControllerProbe::new(ring, true)
            .with_credentials(Some("admin".into()), Some("pw".into()));

        prober.probe(&url_of(&server)).unwrap();
        login.assert_hits(0);
    }
}
