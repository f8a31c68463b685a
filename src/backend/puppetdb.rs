use std::iter::Peekable;
use std::time::Duration;
use std::vec::IntoIter;

use async_trait::async_trait;
use displaydoc::Display;
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::nodeset::{self, NodeSet};

use super::Backend;

#[derive(Debug, Display, Error)]
pub enum Error {
    /// Empty query.
    EmptyQuery,
    /// Unexpected character `{0}` in query.
    UnexpectedChar(char),
    /// Unterminated quoted string.
    UnterminatedQuote,
    /// Unexpected token `{0}`.
    UnexpectedToken(String),
    /// Expected `and` or `or` before `{0}`.
    MissingBoolean(String),
    /// Got `{0}` in a group already combined with `{1}`.
    MixedBooleans(&'static str, &'static str),
    /// Dangling `{0}` at end of query.
    Dangling(&'static str),
    /// Unbalanced parentheses.
    UnbalancedParens,
    /// Subgroup is empty.
    EmptySubgroup,
    /// Missing value after operator `{0}`.
    MissingValue(String),
    /// Fact query `{0}` requires an operator and a value.
    FactNeedsValue(String),
    /// The `!=` operator is not supported by this backend.
    UnsupportedOperator,
    /// Invalid category `{0}`.
    InvalidCategory(String),
    /// Resource key `{0}` cannot select both a parameter (`%`) and a field (`@`).
    ParameterAndField(String),
    /// Mixed endpoints in one query: `{0}` and `{1}`.
    MixedEndpoints(&'static str, &'static str),
    /// Class shortcut `{0}` takes a value only through `%param` or `@field`.
    ClassValue(String),
    /// Invalid host expression: {0}
    Hosts(#[from] nodeset::Error),
    /// Failed to build HTTP client: {0}
    BuildClient(reqwest::Error),
    /// Failed to send PuppetDB request: {0}
    SendRequest(reqwest::Error),
    /// Failed to parse PuppetDB response with code `{0}`: {1}
    ParseResponse(StatusCode, reqwest::Error),
    /// PuppetDB returned status `{0}`: {1}
    ResponseCode(StatusCode, String),
}

impl Error {
    pub fn is_parse(&self) -> bool {
        !matches!(
            self,
            Error::BuildClient(_)
                | Error::SendRequest(_)
                | Error::ParseResponse(..)
                | Error::ResponseCode(..)
        )
    }
}

/// Remote API endpoint a query category maps to. One query speaks to
/// exactly one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Endpoint {
    Nodes,
    Resources,
    Inventory,
}

impl Endpoint {
    const fn path(self) -> &'static str {
        match self {
            Endpoint::Nodes => "nodes",
            Endpoint::Resources => "resources",
            Endpoint::Inventory => "inventory",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Category {
    Fact,
    Resource,
    Class,
    Profile,
    Role,
    Inventory,
}

impl Category {
    fn from_letter(letter: char) -> Option<Category> {
        match letter.to_ascii_uppercase() {
            'F' => Some(Category::Fact),
            'R' => Some(Category::Resource),
            'C' => Some(Category::Class),
            'P' => Some(Category::Profile),
            'O' => Some(Category::Role),
            'I' => Some(Category::Inventory),
            _ => None,
        }
    }

    const fn endpoint(self) -> Endpoint {
        match self {
            Category::Fact => Endpoint::Nodes,
            Category::Inventory => Endpoint::Inventory,
            Category::Resource | Category::Class | Category::Profile | Category::Role => {
                Endpoint::Resources
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Not,
    Selector { category: Category, key: String },
    Operator(&'static str),
    Quoted(String),
    Word(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Open => "(".to_owned(),
            Token::Close => ")".to_owned(),
            Token::And => "and".to_owned(),
            Token::Or => "or".to_owned(),
            Token::Not => "not".to_owned(),
            Token::Selector { key, .. } => key.clone(),
            Token::Operator(op) => (*op).to_owned(),
            Token::Quoted(value) | Token::Word(value) => value.clone(),
        }
    }
}

/// Queries a PuppetDB instance: the parsed DSL tree is translated into the
/// remote nested-array syntax, wrapped in a `certname` extraction envelope
/// and POSTed to the endpoint selected by the query categories.
pub struct PuppetDbQuery {
    url: String,
    timeout: Duration,
}

impl PuppetDbQuery {
    pub fn new(config: &Config) -> Self {
        let puppetdb = &config.puppetdb;
        PuppetDbQuery {
            url: format!(
                "{scheme}://{host}:{port}/pdb/query/v4",
                scheme = puppetdb.scheme,
                host = puppetdb.host,
                port = puppetdb.port,
            ),
            timeout: puppetdb.timeout,
        }
    }

    /// Translate the query into `(endpoint, envelope)` without touching the
    /// network. The envelope is always
    /// `["extract", ["certname"], <query>, ["group_by", "certname"]]`.
    fn build(&self, query: &str) -> Result<(Endpoint, Value), Error> {
        let tokens = tokenize(query)?;
        if tokens.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let mut iter = tokens.into_iter().peekable();
        let mut endpoint = None;
        let inner = parse_group(&mut iter, &mut endpoint, 0)?;
        let envelope = json!(["extract", ["certname"], inner, ["group_by", "certname"]]);
        Ok((endpoint.unwrap_or(Endpoint::Nodes), envelope))
    }

    async fn request(&self, endpoint: Endpoint, query: Value) -> Result<NodeSet, Error> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(Error::BuildClient)?;
        let url = format!("{}/{}", self.url, endpoint.path());
        debug!("Querying puppetdb at {url}: {query}");

        let resp = client
            .post(&url)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(Error::SendRequest)?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .map_err(|err| Error::ParseResponse(status, err))?;
            return Err(Error::ResponseCode(status, message));
        }

        let rows: Vec<Value> = resp
            .json()
            .await
            .map_err(|err| Error::ParseResponse(status, err))?;
        let hosts = rows
            .iter()
            .filter_map(|row| row.get("certname"))
            .filter_map(Value::as_str)
            .collect();
        Ok(hosts)
    }
}

#[async_trait]
impl Backend for PuppetDbQuery {
    async fn execute(&mut self, query: &str) -> Result<NodeSet, super::Error> {
        let (endpoint, envelope) = self.build(query)?;
        Ok(self.request(endpoint, envelope).await?)
    }
}

fn set_endpoint(current: &mut Option<Endpoint>, wanted: Endpoint) -> Result<(), Error> {
    match current {
        None => {
            *current = Some(wanted);
            Ok(())
        }
        Some(existing) if *existing == wanted => Ok(()),
        Some(existing) => Err(Error::MixedEndpoints(existing.path(), wanted.path())),
    }
}

fn parse_group(
    iter: &mut Peekable<IntoIter<Token>>,
    endpoint: &mut Option<Endpoint>,
    depth: usize,
) -> Result<Value, Error> {
    let mut items: Vec<Value> = Vec::new();
    let mut bool_op: Option<&'static str> = None;
    let mut expect_item = true;

    loop {
        match iter.peek() {
            None => {
                if depth > 0 {
                    return Err(Error::UnbalancedParens);
                }
                break;
            }
            Some(Token::Close) => {
                if depth == 0 {
                    return Err(Error::UnbalancedParens);
                }
                iter.next();
                break;
            }
            Some(Token::And) | Some(Token::Or) => {
                let keyword = if matches!(iter.peek(), Some(Token::And)) {
                    "and"
                } else {
                    "or"
                };
                if expect_item {
                    return Err(Error::UnexpectedToken(keyword.to_owned()));
                }
                match bool_op {
                    None => bool_op = Some(keyword),
                    Some(current) if current != keyword => {
                        return Err(Error::MixedBooleans(keyword, current))
                    }
                    Some(_) => {}
                }
                iter.next();
                expect_item = true;
            }
            Some(token) => {
                if !expect_item {
                    return Err(Error::MissingBoolean(token.describe()));
                }
                items.push(parse_item(iter, endpoint, depth)?);
                expect_item = false;
            }
        }
    }

    if expect_item && !items.is_empty() {
        return Err(Error::Dangling(bool_op.unwrap_or("and")));
    }
    if items.is_empty() {
        return Err(if depth == 0 {
            Error::EmptyQuery
        } else {
            Error::EmptySubgroup
        });
    }

    Ok(match bool_op {
        None => items.remove(0),
        Some(op) => {
            let mut array = vec![Value::from(op)];
            array.extend(items);
            Value::Array(array)
        }
    })
}

fn parse_item(
    iter: &mut Peekable<IntoIter<Token>>,
    endpoint: &mut Option<Endpoint>,
    depth: usize,
) -> Result<Value, Error> {
    let mut negate = false;
    if matches!(iter.peek(), Some(Token::Not)) {
        iter.next();
        negate = true;
    }

    let clause = match iter.next() {
        Some(Token::Open) => parse_group(iter, endpoint, depth + 1)?,
        Some(Token::Selector { category, key }) => {
            set_endpoint(endpoint, category.endpoint())?;
            let operation = parse_operation(iter)?;
            build_clause(category, &key, operation)?
        }
        Some(Token::Word(word)) => hosts_clause(&word)?,
        Some(token) => return Err(Error::UnexpectedToken(token.describe())),
        None => return Err(Error::Dangling("not")),
    };

    Ok(if negate { json!(["not", clause]) } else { clause })
}

/// Optional trailing `<operator> <value>` of a selector.
fn parse_operation(
    iter: &mut Peekable<IntoIter<Token>>,
) -> Result<Option<(&'static str, String)>, Error> {
    let Some(Token::Operator(_)) = iter.peek() else {
        return Ok(None);
    };
    let Some(Token::Operator(op)) = iter.next() else {
        return Err(Error::UnexpectedToken("operator".to_owned()));
    };
    match iter.next() {
        Some(Token::Quoted(value)) | Some(Token::Word(value)) => Ok(Some((op, value))),
        _ => Err(Error::MissingValue(op.to_owned())),
    }
}

fn build_clause(
    category: Category,
    key: &str,
    operation: Option<(&'static str, String)>,
) -> Result<Value, Error> {
    match category {
        Category::Fact => {
            let (op, value) = operation.ok_or_else(|| Error::FactNeedsValue(key.to_owned()))?;
            let value = escape_for(op, value);
            Ok(json!([op, ["fact", key], value]))
        }
        Category::Inventory => {
            let (op, value) = operation.ok_or_else(|| Error::FactNeedsValue(key.to_owned()))?;
            let value = escape_for(op, value);
            Ok(json!([op, key, value]))
        }
        Category::Resource => resource_clause(key, operation),
        Category::Class | Category::Profile | Category::Role => {
            class_clause(category, key, operation)
        }
    }
}

/// Build a resource query, resolving the `%param` and `@field` special
/// forms of the key.
fn resource_clause(key: &str, operation: Option<(&'static str, String)>) -> Result<Value, Error> {
    if key.contains('%') && key.contains('@') {
        return Err(Error::ParameterAndField(key.to_owned()));
    }

    if let Some((resource, param)) = key.split_once('%') {
        let (op, value) =
            operation.ok_or_else(|| Error::MissingValue(format!("{resource}%{param}")))?;
        let value = escape_for(op, value);
        return Ok(json!(["and", ["=", "type", resource], [op, ["parameter", param], value]]));
    }

    if let Some((resource, field)) = key.split_once('@') {
        let (op, value) =
            operation.ok_or_else(|| Error::MissingValue(format!("{resource}@{field}")))?;
        let value = escape_for(op, value);
        return Ok(json!(["and", ["=", "type", resource], [op, field, value]]));
    }

    match operation {
        None => Ok(json!(["and", ["=", "type", key]])),
        Some((op, value)) => {
            let value = escape_for(op, value);
            Ok(json!(["and", ["=", "type", key], [op, "title", value]]))
        }
    }
}

/// Class-like shortcuts: the key is a class title normalized to
/// `Capitalized::Segments`, optionally refined by `%param`/`@field`, in
/// which case the title clause and the refinement clause are conjoined.
fn class_clause(
    category: Category,
    key: &str,
    operation: Option<(&'static str, String)>,
) -> Result<Value, Error> {
    let (base, refinement) = match (key.split_once('%'), key.split_once('@')) {
        (Some(_), Some(_)) => return Err(Error::ParameterAndField(key.to_owned())),
        (Some((base, param)), None) => (base, Some(('%', param))),
        (None, Some((base, field))) => (base, Some(('@', field))),
        (None, None) => (key, None),
    };

    let title = match category {
        Category::Profile => normalize_title(&format!("profile::{base}")),
        Category::Role => normalize_title(&format!("role::{base}")),
        _ => normalize_title(base),
    };
    let title_clause = json!(["and", ["=", "type", "Class"], ["=", "title", title]]);

    match refinement {
        None => {
            if operation.is_some() {
                return Err(Error::ClassValue(key.to_owned()));
            }
            Ok(title_clause)
        }
        Some((kind, name)) => {
            let (op, value) =
                operation.ok_or_else(|| Error::MissingValue(format!("{base}{kind}{name}")))?;
            let value = escape_for(op, value);
            let refine_clause = if kind == '%' {
                json!(["and", ["=", "type", "Class"], [op, ["parameter", name], value]])
            } else {
                json!(["and", ["=", "type", "Class"], [op, name, value]])
            };
            Ok(json!(["and", title_clause, refine_clause]))
        }
    }
}

/// Bare hostnames: exact `certname` matches, or anchored regex matches for
/// glob patterns, combined with `or`.
fn hosts_clause(word: &str) -> Result<Value, Error> {
    let hosts = NodeSet::parse(word)?;
    let mut array = vec![Value::from("or")];
    for host in &hosts {
        if host.contains('*') || host.contains('?') {
            array.push(json!(["~", "certname", glob_to_regex(host)]));
        } else {
            array.push(json!(["=", "certname", host]));
        }
    }
    Ok(Value::Array(array))
}

/// Normalize a class title to `Capitalized::Segments`, accepting `/` as a
/// path-style segment separator.
fn normalize_title(raw: &str) -> String {
    raw.replace('/', "::")
        .split("::")
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("::")
}

/// The remote API requires literal backslashes doubled in regex values.
fn escape_for(op: &str, value: String) -> String {
    if op == "~" {
        value.replace('\\', "\\\\")
    } else {
        value
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => regex.push(ch),
        }
    }
    regex.push('$');
    regex
}

const WORD_CHARS: &str = "-_.%@:/\\[],*?+";

fn tokenize(query: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '(' {
            chars.next();
            tokens.push(Token::Open);
        } else if ch == ')' {
            chars.next();
            tokens.push(Token::Close);
        } else if ch == '"' || ch == '\'' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == ch => break,
                    Some(c) => value.push(c),
                    None => return Err(Error::UnterminatedQuote),
                }
            }
            tokens.push(Token::Quoted(value));
        } else if ch == '=' || ch == '~' {
            chars.next();
            tokens.push(Token::Operator(if ch == '=' { "=" } else { "~" }));
        } else if ch == '<' || ch == '>' {
            chars.next();
            let op = if chars.peek() == Some(&'=') {
                chars.next();
                if ch == '<' {
                    "<="
                } else {
                    ">="
                }
            } else if ch == '<' {
                "<"
            } else {
                ">"
            };
            tokens.push(Token::Operator(op));
        } else if ch == '!' {
            chars.next();
            if chars.peek() == Some(&'=') {
                return Err(Error::UnsupportedOperator);
            }
            return Err(Error::UnexpectedChar('!'));
        } else if ch.is_alphanumeric() || WORD_CHARS.contains(ch) {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || WORD_CHARS.contains(c) {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(classify_word(word)?);
        } else {
            return Err(Error::UnexpectedChar(ch));
        }
    }

    Ok(tokens)
}

fn classify_word(word: String) -> Result<Token, Error> {
    match word.to_ascii_lowercase().as_str() {
        "and" => return Ok(Token::And),
        "or" => return Ok(Token::Or),
        "not" => return Ok(Token::Not),
        _ => {}
    }

    let mut chars = word.chars();
    let first = chars.next();
    let second = chars.next();
    if let (Some(letter), Some(':')) = (first, second) {
        let key: String = chars.collect();
        if key.is_empty() {
            return Err(Error::UnexpectedToken(word));
        }
        let category =
            Category::from_letter(letter).ok_or_else(|| Error::InvalidCategory(word.clone()))?;
        return Ok(Token::Selector { category, key });
    }

    Ok(Token::Word(word))
}
