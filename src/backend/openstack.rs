use std::collections::BTreeMap;

use async_trait::async_trait;
use displaydoc::Display;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, OpenStackConfig};
use crate::nodeset::NodeSet;

use super::Backend;

#[derive(Debug, Display, Error)]
pub enum Error {
    /// Empty query.
    EmptyQuery,
    /// Unexpected character `{0}` in query.
    UnexpectedChar(char),
    /// Unterminated quoted string.
    UnterminatedQuote,
    /// Invalid token `{0}`, expected `key:value`.
    InvalidToken(String),
    /// The `*` wildcard cannot be combined with other filters.
    MixedWildcard,
    /// Failed to build HTTP client: {0}
    BuildClient(reqwest::Error),
    /// Failed to send request to `{0}`: {1}
    SendRequest(String, reqwest::Error),
    /// The identity API did not return a token.
    MissingToken,
    /// Failed to parse response with code `{0}`: {1}
    ParseResponse(StatusCode, reqwest::Error),
    /// Got status `{0}` from `{1}`: {2}
    ResponseCode(StatusCode, String, String),
}

impl Error {
    pub fn is_parse(&self) -> bool {
        matches!(
            self,
            Error::EmptyQuery
                | Error::UnexpectedChar(_)
                | Error::UnterminatedQuote
                | Error::InvalidToken(_)
                | Error::MixedWildcard
        )
    }
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    projects: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

/// Queries VMs deployed in an OpenStack infrastructure.
///
/// The `project` key scopes the search to one project; any other `key:value`
/// token is passed through as a server-list filter. Without a project, all
/// visible projects except the special `admin` one are enumerated and their
/// server lists merged.
pub struct OpenStackQuery {
    config: OpenStackConfig,
    search_project: Option<String>,
    search_params: BTreeMap<String, String>,
}

impl OpenStackQuery {
    pub fn new(config: &Config) -> Self {
        let config = config.openstack.clone();
        let mut search_params = default_search_params();
        let mut search_project = None;
        for (key, value) in &config.query_params {
            if key == "project" {
                search_project = Some(value.clone());
            } else {
                search_params.insert(key.clone(), value.clone());
            }
        }

        OpenStackQuery {
            config,
            search_project,
            search_params,
        }
    }

    fn parse(&mut self, query: &str) -> Result<(), Error> {
        let tokens = tokenize(query)?;
        if tokens.is_empty() {
            return Err(Error::EmptyQuery);
        }
        if tokens.iter().any(|token| matches!(token, QueryToken::All)) {
            if tokens.len() > 1 {
                return Err(Error::MixedWildcard);
            }
            return Ok(()); // The defaults already select everything.
        }

        for token in tokens {
            if let QueryToken::Filter { key, value } = token {
                if key == "project" {
                    self.search_project = Some(value);
                } else {
                    self.search_params.insert(key, value);
                }
            }
        }
        Ok(())
    }

    async fn resolve(&self) -> Result<NodeSet, Error> {
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .build()
            .map_err(Error::BuildClient)?;

        match &self.search_project {
            Some(project) => self.project_hosts(&client, project).await,
            None => {
                let mut hosts = NodeSet::new();
                for project in self.projects(&client).await? {
                    hosts |= &self.project_hosts(&client, &project).await?;
                }
                Ok(hosts)
            }
        }
    }

    /// All enabled project names, filtering out the special `admin` project.
    async fn projects(&self, client: &reqwest::Client) -> Result<Vec<String>, Error> {
        let token = self.authenticate(client, None).await?;
        let url = format!("{}/v3/projects", self.config.auth_url);
        let resp = client
            .get(&url)
            .query(&[("enabled", "true")])
            .header("X-Auth-Token", &token)
            .send()
            .await
            .map_err(|err| Error::SendRequest(url.clone(), err))?;
        let list: ProjectList = parse_response(resp, &url).await?;

        Ok(list
            .projects
            .into_iter()
            .map(|project| project.name)
            .filter(|name| name != "admin")
            .collect())
    }

    /// Matching server names in `project`, composed into FQDNs.
    async fn project_hosts(
        &self,
        client: &reqwest::Client,
        project: &str,
    ) -> Result<NodeSet, Error> {
        let token = self.authenticate(client, Some(project)).await?;
        let url = format!("{}/servers", self.config.compute_url);
        let resp = client
            .get(&url)
            .query(&self.search_params)
            .header("X-Auth-Token", &token)
            .send()
            .await
            .map_err(|err| Error::SendRequest(url.clone(), err))?;
        let list: ServerList = parse_response(resp, &url).await?;

        let domain = match &self.config.domain_suffix {
            None => String::new(),
            Some(suffix) if suffix.starts_with('.') => suffix.clone(),
            Some(suffix) => format!(".{suffix}"),
        };
        Ok(list
            .servers
            .into_iter()
            .map(|server| format!("{name}.{project}{domain}", name = server.name))
            .collect())
    }

    /// Password authentication against the identity API, optionally scoped
    /// to a project. Returns the subject token for the follow-up calls.
    async fn authenticate(
        &self,
        client: &reqwest::Client,
        project: Option<&str>,
    ) -> Result<String, Error> {
        let mut auth = json!({
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": self.config.username,
                        "domain": { "id": "default" },
                        "password": self.config.password,
                    }
                }
            }
        });
        if let Some(project) = project {
            auth["scope"] = json!({
                "project": { "name": project, "domain": { "id": "default" } }
            });
        }

        let url = format!("{}/v3/auth/tokens", self.config.auth_url);
        debug!("Authenticating against {url}");
        let resp = client
            .post(&url)
            .json(&json!({ "auth": auth }))
            .send()
            .await
            .map_err(|err| Error::SendRequest(url.clone(), err))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .map_err(|err| Error::ParseResponse(status, err))?;
            return Err(Error::ResponseCode(status, url, message));
        }
        resp.headers()
            .get("X-Subject-Token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or(Error::MissingToken)
    }
}

#[async_trait]
impl Backend for OpenStackQuery {
    async fn execute(&mut self, query: &str) -> Result<NodeSet, super::Error> {
        self.parse(query)?;
        Ok(self.resolve().await?)
    }
}

fn default_search_params() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("status".to_owned(), "ACTIVE".to_owned()),
        ("vm_state".to_owned(), "ACTIVE".to_owned()),
    ])
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    url: &str,
) -> Result<T, Error> {
    let status = resp.status();
    if status.is_success() {
        resp.json()
            .await
            .map_err(|err| Error::ParseResponse(status, err))
    } else {
        let message = resp
            .text()
            .await
            .map_err(|err| Error::ParseResponse(status, err))?;
        Err(Error::ResponseCode(status, url.to_owned(), message))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum QueryToken {
    All,
    Filter { key: String, value: String },
}

fn tokenize(query: &str) -> Result<Vec<QueryToken>, Error> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '*' {
            chars.next();
            tokens.push(QueryToken::All);
        } else if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c) {
                    key.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek() != Some(&':') || key.len() < 2 {
                return Err(Error::InvalidToken(key));
            }
            chars.next();
            let value = scan_value(&mut chars, &key)?;
            tokens.push(QueryToken::Filter { key, value });
        } else {
            return Err(Error::UnexpectedChar(ch));
        }
    }

    Ok(tokens)
}

fn scan_value(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    key: &str,
) -> Result<String, Error> {
    let mut value = String::new();
    match chars.peek() {
        Some(&quote) if quote == '"' || quote == '\'' => {
            chars.next();
            loop {
                match chars.next() {
                    Some(c) if c == quote => break,
                    Some(c) => value.push(c),
                    None => return Err(Error::UnterminatedQuote),
                }
            }
        }
        _ => {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || "(){}".contains(c) {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
    }
    if value.is_empty() {
        return Err(Error::InvalidToken(key.to_owned()));
    }
    Ok(value)
}
