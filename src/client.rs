use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const API_PREFIX: &str = "/v3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AGENT: &str = concat!("gns3ctl/", env!("CARGO_PKG_VERSION"));

/// Controller endpoints this tool talks to. Paths are relative to `/v3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Me,
    Authenticate,
}

impl Endpoint {
    pub fn method(self) -> Method {
        match self {
            Endpoint::Me => Method::GET,
            Endpoint::Authenticate => Method::POST,
        }
    }

    pub fn path(self) -> String {
        let tail = match self {
            Endpoint::Me => "/access/users/me",
            Endpoint::Authenticate => "/access/users/authenticate",
        };
        format!("{API_PREFIX}{tail}")
    }
}

#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: u16,
    pub body: String,
    pub json: Option<Value>,
}

impl ResponseData {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "bearer")]
    pub token_type: String,
}

fn bearer() -> String {
    "bearer".to_string()
}

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    http: Client,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, verify_tls: bool) -> Result<Self> {
        let parsed = Url::parse(base_url).context("parsing controller URL")?;
        let http = Client::builder()
            .user_agent(HeaderValue::from_static(AGENT))
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            base_url: parsed,
            http,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sends one request. Non-2xx statuses are returned, not raised, so the
    /// caller can tell a 401 from other failures.
    pub fn call<T: Serialize + ?Sized>(
        &self,
        endpoint: Endpoint,
        body: Option<&T>,
    ) -> Result<ResponseData> {
        let path = endpoint.path();
        let url = self
            .base_url
            .join(&path)
            .with_context(|| format!("joining path `{path}` to controller URL"))?;

        let mut request = self
            .http
            .request(endpoint.method(), url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(USER_AGENT, HeaderValue::from_static(AGENT));

        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().context("sending request")?;

        let status = response.status().as_u16();
        let text = response.text().context("reading response body")?;
        let json = serde_json::from_str(&text).ok();

        Ok(ResponseData {
            status,
            body: text,
            json,
        })
    }

    pub fn authenticate(&self, user: &str, password: &str) -> Result<Token> {
        let response = self.call(
            Endpoint::Authenticate,
            Some(&Credentials {
                username: user,
                password,
            }),
        )?;
        if !response.is_success() {
            bail!(
                "authentication failed with status {}: {}",
                response.status,
                response.body.trim()
            );
        }
        let json = response
            .json
            .context("authentication response was not JSON")?;
        serde_json::from_value(json).context("decoding access token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn sends_bearer_token_to_me_endpoint() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v3/access/users/me")
                .header("Authorization", "Bearer tok");
            then.status(200).json_body(json!({"username": "admin"}));
        });

        let client = ApiClient::new(&server.base_url(), true)
            .unwrap()
            .with_token("tok");
        let response = client.call(Endpoint::Me, Option::<&Value>::None).unwrap();

        mock.assert();
        assert!(response.is_success());
        assert_eq!(response.json.unwrap()["username"], "admin");
    }

    #[test]
    fn error_statuses_are_returned_not_raised() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v3/access/users/me");
            then.status(401).body("nope");
        });

        let client = ApiClient::new(&server.base_url(), true).unwrap();
        let response = client.call(Endpoint::Me, Option::<&Value>::None).unwrap();

        assert_eq!(response.status, 401);
        assert!(response.json.is_none());
    }

    #[test]
    fn authenticate_posts_credentials() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v3/access/users/authenticate")
                .json_body(json!({"username": "admin", "password": "secret"}));
            then.status(200)
                .json_body(json!({"access_token": "abc", "token_type": "bearer"}));
        });

        let client = ApiClient::new(&server.base_url(), true).unwrap();
        let token = client.authenticate("admin", "secret").unwrap();

        mock.assert();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.token_type, "bearer");
    }

    #[test]
    fn rejected_credentials_fail() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v3/access/users/authenticate");
            then.status(401);
        });

        let client = ApiClient::new(&server.base_url(), true).unwrap();
        let err = client.authenticate("admin", "wrong").unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
