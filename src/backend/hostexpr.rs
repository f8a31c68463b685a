//! Boolean host-expression grammar shared by the host-list backends.
//!
//! Parses `item (boolean item)*` with parenthesized subgroups into an arena
//! of elements, then aggregates leaf host sets left-to-right. Parentheses
//! are the only grouping device; operators carry no precedence.

use displaydoc::Display;
use thiserror::Error;

use crate::nodeset::NodeSet;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum Error {
    /// Empty query.
    EmptyQuery,
    /// Unexpected character `{0}` in query.
    UnexpectedChar(char),
    /// Unexpected operator `{0}`, expected a host expression or `(`.
    UnexpectedOperator(String),
    /// Expected an operator before `{0}`.
    MissingOperator(String),
    /// Dangling operator `{0}` at end of query.
    DanglingOperator(String),
    /// Unbalanced parentheses.
    UnbalancedParens,
    /// Subgroup is empty.
    EmptySubgroup,
    /// Aggregation out of order: operator `{0:?}` with accumulator seeded.
    Aggregation(Option<BoolOp>),
}

/// Boolean set operator between two sibling elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoolOp {
    Or,
    And,
    AndNot,
    Xor,
}

impl BoolOp {
    pub fn apply(self, accumulator: &NodeSet, hosts: &NodeSet) -> NodeSet {
        match self {
            BoolOp::Or => accumulator | hosts,
            BoolOp::And => accumulator & hosts,
            BoolOp::AndNot => accumulator - hosts,
            BoolOp::Xor => accumulator ^ hosts,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            BoolOp::Or => "or",
            BoolOp::And => "and",
            BoolOp::AndNot => "and not",
            BoolOp::Xor => "xor",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Bool(BoolOp),
    Word(String),
}

/// One element of the parse arena. A leaf holds the raw word it was parsed
/// from; an interior element aggregates its children. `op` records how the
/// element combines with the accumulator of its siblings; the first sibling
/// carries none.
#[derive(Debug, Default)]
struct Element {
    word: Option<String>,
    op: Option<BoolOp>,
    children: Vec<usize>,
}

/// Parsed host-expression tree, an arena keyed by element index.
#[derive(Debug)]
pub struct Tree {
    elements: Vec<Element>,
}

impl Tree {
    /// Parse `query` into a tree. With `globs`, the `*` and `?` wildcard
    /// characters are accepted inside host words.
    pub fn parse(query: &str, globs: bool) -> Result<Tree, Error> {
        let tokens = tokenize(query, globs)?;
        if tokens.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let mut tree = Tree {
            elements: vec![Element::default()],
        };
        let mut stack = vec![0usize];
        let mut pending_op: Option<BoolOp> = None;
        let mut expect_item = true;

        for token in tokens {
            match token {
                Token::Open => {
                    if !expect_item {
                        return Err(Error::MissingOperator("(".to_owned()));
                    }
                    let index = tree.push(Element {
                        op: pending_op.take(),
                        ..Element::default()
                    });
                    let current = *stack.last().ok_or(Error::UnbalancedParens)?;
                    tree.elements[current].children.push(index);
                    stack.push(index);
                }
                Token::Close => {
                    if let Some(op) = pending_op.take() {
                        return Err(Error::DanglingOperator(op.keyword().to_owned()));
                    }
                    let closed = stack.pop().ok_or(Error::UnbalancedParens)?;
                    if stack.is_empty() {
                        return Err(Error::UnbalancedParens);
                    }
                    if tree.elements[closed].children.is_empty() {
                        return Err(Error::EmptySubgroup);
                    }
                    expect_item = false;
                }
                Token::Bool(op) => {
                    if expect_item {
                        return Err(Error::UnexpectedOperator(op.keyword().to_owned()));
                    }
                    pending_op = Some(op);
                    expect_item = true;
                }
                Token::Word(word) => {
                    if !expect_item {
                        return Err(Error::MissingOperator(word));
                    }
                    let index = tree.push(Element {
                        word: Some(word),
                        op: pending_op.take(),
                        children: Vec::new(),
                    });
                    let current = *stack.last().ok_or(Error::UnbalancedParens)?;
                    tree.elements[current].children.push(index);
                    expect_item = false;
                }
            }
        }

        if let Some(op) = pending_op {
            return Err(Error::DanglingOperator(op.keyword().to_owned()));
        }
        if stack.len() != 1 {
            return Err(Error::UnbalancedParens);
        }
        if tree.elements[0].children.is_empty() {
            return Err(Error::EmptyQuery);
        }
        Ok(tree)
    }

    /// Evaluate the tree with a post-order walk, resolving each leaf word
    /// through `resolve` and aggregating siblings left-to-right.
    pub fn evaluate<E, F>(&self, resolve: &mut F) -> Result<NodeSet, E>
    where
        F: FnMut(&str) -> Result<NodeSet, E>,
        E: From<Error>,
    {
        self.evaluate_element(0, resolve)
    }

    fn evaluate_element<E, F>(&self, index: usize, resolve: &mut F) -> Result<NodeSet, E>
    where
        F: FnMut(&str) -> Result<NodeSet, E>,
        E: From<Error>,
    {
        let element = &self.elements[index];
        if let Some(word) = &element.word {
            return resolve(word);
        }

        let mut accumulator: Option<NodeSet> = None;
        for &child in &element.children {
            let hosts = self.evaluate_element(child, resolve)?;
            let op = self.elements[child].op;
            accumulator = Some(match (accumulator, op) {
                (None, None) => hosts,
                (Some(acc), Some(op)) => op.apply(&acc, &hosts),
                // First sibling with an operator, or a later one without:
                // the parser never builds this shape.
                (_, op) => return Err(Error::Aggregation(op).into()),
            });
        }
        accumulator.ok_or_else(|| Error::EmptySubgroup.into())
    }

    fn push(&mut self, element: Element) -> usize {
        self.elements.push(element);
        self.elements.len() - 1
    }
}

const WORD_CHARS: &str = "-_.,!&^[]";
const GLOB_CHARS: &str = "*?";

fn tokenize(query: &str, globs: bool) -> Result<Vec<Token>, Error> {
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
        } else if ch.is_alphanumeric() || WORD_CHARS.contains(ch) || (globs && GLOB_CHARS.contains(ch)) {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_alphanumeric() || WORD_CHARS.contains(ch) || (globs && GLOB_CHARS.contains(ch)) {
                    word.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(keyword_or_word(word));
        } else {
            return Err(Error::UnexpectedChar(ch));
        }
    }

    Ok(merge_and_not(tokens))
}

fn keyword_or_word(word: String) -> Token {
    match word.to_ascii_lowercase().as_str() {
        "or" => Token::Bool(BoolOp::Or),
        "and" => Token::Bool(BoolOp::And),
        "xor" => Token::Bool(BoolOp::Xor),
        // A bare `not` only acts as an operator right after `and`; anywhere
        // else it is a regular host word, as in the original grammar.
        _ => Token::Word(word),
    }
}

/// Merge an `and` token followed by the word `not` into `and not`.
fn merge_and_not(tokens: Vec<Token>) -> Vec<Token> {
    let mut merged: Vec<Token> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Token::Word(word) = &token {
            if word.eq_ignore_ascii_case("not") {
                if let Some(last @ Token::Bool(BoolOp::And)) = merged.last_mut() {
                    *last = Token::Bool(BoolOp::AndNot);
                    continue;
                }
            }
        }
        merged.push(token);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeset;

    #[derive(Debug, Display, Error, PartialEq, Eq)]
    enum TestError {
        /// grammar: {0}
        Grammar(#[from] Error),
        /// nodeset: {0}
        NodeSet(#[from] nodeset::Error),
    }

    fn eval(query: &str) -> Result<NodeSet, TestError> {
        let tree = Tree::parse(query, false)?;
        tree.evaluate(&mut |word| NodeSet::parse(word).map_err(TestError::from))
    }

    #[test]
    fn single_host() {
        assert_eq!(eval("host1").unwrap().to_string(), "host1");
    }

    #[test]
    fn simple_or() {
        assert_eq!(eval("host1 or host2").unwrap().to_string(), "host[1-2]");
    }

    #[test]
    fn nested_and_not() {
        // (host[1-5]) and not host2
        let hosts = eval("(host[1-5]) and not host2").unwrap();
        assert_eq!(hosts.to_string(), "host[1,3-5]");
    }

    #[test]
    fn operators_apply_left_to_right() {
        // No precedence: ((host[1-3] or host[5-6]) and host[2-5]) = host[2-3,5]
        let hosts = eval("host[1-3] or host[5-6] and host[2-5]").unwrap();
        assert_eq!(hosts.to_string(), "host[2-3,5]");
    }

    #[test]
    fn parentheses_group() {
        let hosts = eval("host[1-3] or (host[5-6] and host[2-5])").unwrap();
        assert_eq!(hosts.to_string(), "host[1-3,5]");
    }

    #[test]
    fn xor_operator() {
        let hosts = eval("host[1-3] xor host[2-4]").unwrap();
        assert_eq!(hosts.to_string(), "host[1,4]");
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let hosts = eval("host1 OR host2 AND NOT host2").unwrap();
        assert_eq!(hosts.to_string(), "host1");
    }

    #[test]
    fn rejects_empty_query() {
        assert_eq!(eval("  "), Err(TestError::Grammar(Error::EmptyQuery)));
    }

    #[test]
    fn rejects_leading_operator() {
        assert!(matches!(eval("or host1"), Err(TestError::Grammar(Error::UnexpectedOperator(_)))));
    }

    #[test]
    fn rejects_dangling_operator() {
        assert!(matches!(eval("host1 and"), Err(TestError::Grammar(Error::DanglingOperator(_)))));
    }

    #[test]
    fn rejects_missing_operator() {
        assert!(matches!(eval("(host1) (host2)"), Err(TestError::Grammar(Error::MissingOperator(_)))));
    }

    #[test]
    fn rejects_unbalanced_parens() {
        assert!(matches!(eval("(host1"), Err(TestError::Grammar(Error::UnbalancedParens))));
        assert!(matches!(eval("host1)"), Err(TestError::Grammar(Error::UnbalancedParens))));
    }

    #[test]
    fn rejects_empty_subgroup() {
        assert!(matches!(eval("()"), Err(TestError::Grammar(Error::EmptySubgroup))));
    }

    #[test]
    fn rejects_glob_chars_without_globs() {
        assert!(matches!(eval("host*"), Err(TestError::Grammar(Error::UnexpectedChar('*')))));
    }

    #[test]
    fn accepts_glob_chars_with_globs() {
        assert!(Tree::parse("host* or db?", true).is_ok());
    }
}
