//! Top-level multi-query grammar: composes per-backend subqueries and
//! named aliases with boolean set operators, with parentheses as the only
//! grouping device.
//!
//! A backend subquery is written `P{backend-specific query}`; aliases as
//! `A:name` expand recursively at parse time. With a default backend
//! configured, the full query string is first tried against that backend
//! alone, falling back to this grammar on parse failure.

use displaydoc::Display;
use thiserror::Error;
use tracing::debug;

use crate::backend::hostexpr::BoolOp;
use crate::backend::{self, Registry};
use crate::config::Config;
use crate::nodeset::NodeSet;

#[derive(Debug, Display, Error)]
pub enum Error {
    /// {0}
    Backend(#[from] backend::Error),
    /// Empty query.
    EmptyQuery,
    /// Unexpected character `{0}` in query.
    UnexpectedChar(char),
    /// Unknown token `{0}`, expected a backend query, an alias or `(`.
    UnknownToken(String),
    /// Unterminated backend query block, missing `}}`.
    UnterminatedBlock,
    /// Backend query blocks cannot nest.
    NestedBlock,
    /// Unexpected operator `{0}`.
    UnexpectedOperator(String),
    /// Expected an operator before `{0}`.
    MissingOperator(String),
    /// Dangling operator `{0}` at end of query.
    DanglingOperator(String),
    /// Unbalanced parentheses.
    UnbalancedParens,
    /// Subgroup is empty.
    EmptySubgroup,
    /// Unable to find alias replacement for `{0}` in the configuration.
    UnknownAlias(String),
    /// Cyclic alias expansion detected at `{0}`.
    AliasCycle(String),
    /// Aggregation out of order, this is a bug.
    Aggregation,
    /// Unable to parse query `{query}` with the default backend `{backend}` ({backend_error}) nor with the global grammar ({global_error}).
    BothFailed {
        query: String,
        backend: String,
        backend_error: String,
        global_error: String,
    },
}

impl Error {
    /// Whether this is a query-syntax failure rather than an I/O one.
    pub fn is_parse(&self) -> bool {
        match self {
            Error::Backend(err) => err.is_parse(),
            _ => true,
        }
    }
}

/// The main query engine: resolves a composite query string into hosts.
pub struct Query<'a> {
    config: &'a Config,
    registry: &'a Registry,
}

impl<'a> Query<'a> {
    pub fn new(config: &'a Config, registry: &'a Registry) -> Self {
        Query { config, registry }
    }

    pub async fn execute(&self, query_string: &str) -> Result<NodeSet, Error> {
        let Some(name) = &self.config.default_backend else {
            return self.execute_global(query_string).await;
        };

        let descriptor = self.registry.by_name(name)?;
        let mut backend = descriptor.build(self.config);
        match backend.execute(query_string).await {
            Ok(hosts) => Ok(hosts),
            Err(err) if err.is_parse() => {
                debug!("Query not parsable with default backend {name}, trying the global grammar");
                match self.execute_global(query_string).await {
                    Ok(hosts) => Ok(hosts),
                    Err(global_err) if global_err.is_parse() => Err(Error::BothFailed {
                        query: query_string.to_owned(),
                        backend: name.clone(),
                        backend_error: err.to_string(),
                        global_error: global_err.to_string(),
                    }),
                    Err(global_err) => Err(global_err),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn execute_global(&self, query_string: &str) -> Result<NodeSet, Error> {
        let mut parser = Parser::new(self.config, self.registry);
        let mut alias_stack = Vec::new();
        parser.parse(query_string, 0, &mut alias_stack)?;
        if parser.elements[0].children.is_empty() {
            return Err(Error::EmptyQuery);
        }

        // Resolve subquery leaves in order; backends may block on I/O.
        for index in 0..parser.elements.len() {
            if let Some((prefix, body)) = parser.elements[index].leaf.clone() {
                let descriptor = self.registry.by_prefix(&prefix)?;
                let mut backend = descriptor.build(self.config);
                let hosts = backend.execute(&body).await?;
                debug!("Backend {} returned {} hosts", descriptor.name, hosts.len());
                parser.elements[index].hosts = Some(hosts);
            }
        }

        parser.evaluate(0)
    }
}

#[derive(Debug, Default)]
struct Element {
    /// Pending backend subquery `(prefix, body)` of a leaf.
    leaf: Option<(String, String)>,
    hosts: Option<NodeSet>,
    op: Option<BoolOp>,
    children: Vec<usize>,
}

/// Arena parser for the top-level grammar. Aliases are expanded by parsing
/// their body into a fresh subgroup under the current element.
struct Parser<'a> {
    config: &'a Config,
    registry: &'a Registry,
    elements: Vec<Element>,
}

impl<'a> Parser<'a> {
    fn new(config: &'a Config, registry: &'a Registry) -> Self {
        Parser {
            config,
            registry,
            elements: vec![Element::default()],
        }
    }

    fn parse(
        &mut self,
        input: &str,
        group: usize,
        alias_stack: &mut Vec<String>,
    ) -> Result<(), Error> {
        let tokens = tokenize(input, self.registry)?;
        if tokens.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let mut stack = vec![group];
        let mut pending_op: Option<BoolOp> = None;
        let mut expect_item = true;

        for token in tokens {
            match token {
                Token::Open => {
                    if !expect_item {
                        return Err(Error::MissingOperator("(".to_owned()));
                    }
                    let index = self.push_child(&stack, Element {
                        op: pending_op.take(),
                        ..Element::default()
                    })?;
                    stack.push(index);
                }
                Token::Close => {
                    if let Some(op) = pending_op.take() {
                        return Err(Error::DanglingOperator(keyword(op).to_owned()));
                    }
                    let closed = stack.pop().ok_or(Error::UnbalancedParens)?;
                    if stack.is_empty() {
                        return Err(Error::UnbalancedParens);
                    }
                    if self.elements[closed].children.is_empty() {
                        return Err(Error::EmptySubgroup);
                    }
                    expect_item = false;
                }
                Token::Bool(op) => {
                    if expect_item {
                        return Err(Error::UnexpectedOperator(keyword(op).to_owned()));
                    }
                    pending_op = Some(op);
                    expect_item = true;
                }
                Token::Subquery { prefix, body } => {
                    if !expect_item {
                        return Err(Error::MissingOperator(prefix));
                    }
                    self.push_child(&stack, Element {
                        leaf: Some((prefix, body)),
                        op: pending_op.take(),
                        ..Element::default()
                    })?;
                    expect_item = false;
                }
                Token::Alias(name) => {
                    if !expect_item {
                        return Err(Error::MissingOperator(name));
                    }
                    if alias_stack.contains(&name) {
                        return Err(Error::AliasCycle(name));
                    }
                    let body = self
                        .config
                        .aliases
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| Error::UnknownAlias(name.clone()))?;

                    let subgroup = self.push_child(&stack, Element {
                        op: pending_op.take(),
                        ..Element::default()
                    })?;
                    alias_stack.push(name);
                    self.parse(&body, subgroup, alias_stack)?;
                    alias_stack.pop();
                    expect_item = false;
                }
            }
        }

        if let Some(op) = pending_op {
            return Err(Error::DanglingOperator(keyword(op).to_owned()));
        }
        if stack.len() != 1 {
            return Err(Error::UnbalancedParens);
        }
        Ok(())
    }

    fn push_child(&mut self, stack: &[usize], element: Element) -> Result<usize, Error> {
        let parent = *stack.last().ok_or(Error::UnbalancedParens)?;
        self.elements.push(element);
        let index = self.elements.len() - 1;
        self.elements[parent].children.push(index);
        Ok(index)
    }

    /// Post-order aggregation walk, strictly left-to-right.
    fn evaluate(&self, index: usize) -> Result<NodeSet, Error> {
        let element = &self.elements[index];
        if let Some(hosts) = &element.hosts {
            return Ok(hosts.clone());
        }

        let mut accumulator: Option<NodeSet> = None;
        for &child in &element.children {
            let hosts = self.evaluate(child)?;
            accumulator = Some(match (accumulator, self.elements[child].op) {
                (None, None) => hosts,
                (Some(acc), Some(op)) => op.apply(&acc, &hosts),
                _ => return Err(Error::Aggregation),
            });
        }
        accumulator.ok_or(Error::EmptySubgroup)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Bool(BoolOp),
    Subquery { prefix: String, body: String },
    Alias(String),
}

const fn keyword(op: BoolOp) -> &'static str {
    match op {
        BoolOp::Or => "or",
        BoolOp::And => "and",
        BoolOp::AndNot => "and not",
        BoolOp::Xor => "xor",
    }
}

const ALIAS_NAME_CHARS: &str = "-_.+";

fn tokenize(input: &str, registry: &Registry) -> Result<Vec<Token>, Error> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '(' {
            chars.next();
            tokens.push(Token::Open);
        } else if ch == ')' {
            chars.next();
            tokens.push(Token::Close);
        } else if ch.is_alphanumeric() {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }

            if chars.peek() == Some(&'{') {
                chars.next();
                let prefix = canonical_prefix(&word, registry)?;
                let body = scan_block(&mut chars)?;
                tokens.push(Token::Subquery { prefix, body });
            } else if word.eq_ignore_ascii_case(backend::ALIAS_PREFIX) && chars.peek() == Some(&':') {
                chars.next();
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || ALIAS_NAME_CHARS.contains(c) {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(Error::UnknownToken(word));
                }
                tokens.push(Token::Alias(name));
            } else {
                match word.to_ascii_lowercase().as_str() {
                    "or" => tokens.push(Token::Bool(BoolOp::Or)),
                    "and" => tokens.push(Token::Bool(BoolOp::And)),
                    "xor" => tokens.push(Token::Bool(BoolOp::Xor)),
                    "not" => {
                        // Only valid as the tail of `and not`.
                        match tokens.last_mut() {
                            Some(last @ Token::Bool(BoolOp::And)) => {
                                *last = Token::Bool(BoolOp::AndNot);
                            }
                            _ => return Err(Error::UnknownToken(word)),
                        }
                    }
                    _ => return Err(Error::UnknownToken(word)),
                }
            }
        } else {
            return Err(Error::UnexpectedChar(ch));
        }
    }

    Ok(tokens)
}

/// The registered prefix matching `word`, case-insensitively.
fn canonical_prefix(word: &str, registry: &Registry) -> Result<String, Error> {
    registry
        .prefixes()
        .find(|prefix| prefix.eq_ignore_ascii_case(word))
        .map(str::to_owned)
        .ok_or_else(|| Error::Backend(backend::Error::UnknownPrefix(word.to_owned())))
}

/// Scan a backend query block up to its closing `}`. Quoted strings may
/// contain braces; an unquoted opener inside the block is an error.
fn scan_block(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String, Error> {
    let mut body = String::new();
    while let Some(ch) = chars.next() {
        match ch {
            '}' => return Ok(body),
            '{' => return Err(Error::NestedBlock),
            '"' | '\'' => {
                body.push(ch);
                let mut closed = false;
                for c in chars.by_ref() {
                    body.push(c);
                    if c == ch {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(Error::UnterminatedBlock);
                }
            }
            _ => body.push(ch),
        }
    }
    Err(Error::UnterminatedBlock)
}
