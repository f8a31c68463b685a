use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, BitXor, BitXorAssign, Sub, SubAssign};

use derive_more::Deref;
use displaydoc::Display;
use thiserror::Error;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum Error {
    /// Empty host expression.
    Empty,
    /// Unbalanced brackets in `{0}`.
    UnbalancedBrackets(String),
    /// Invalid range `{0}` in `{1}`.
    InvalidRange(String, String),
    /// Invalid number `{0}` in `{1}`.
    InvalidNumber(String, String),
}

/// Unordered, de-duplicated set of host names.
///
/// Supports the usual set algebra through operators (`|`, `&`, `-`, `^`) and
/// a compact textual form that folds consecutive numeric suffixes into
/// ranges, so that `host1,host2,host3` renders as `host[1-3]`.
#[derive(Clone, Debug, Default, Deref, PartialEq, Eq)]
pub struct NodeSet(BTreeSet<String>);

impl NodeSet {
    pub fn new() -> Self {
        NodeSet(BTreeSet::new())
    }

    /// Parse a compact host expression into its expanded set of names.
    ///
    /// The expression is a comma-separated list of segments, each optionally
    /// carrying bracketed numeric groups: `host[01-10,15].example,web1`.
    /// Multiple groups in one segment expand as a cartesian product.
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(Error::Empty);
        }

        let mut nodes = BTreeSet::new();
        for segment in split_segments(expr)? {
            if segment.is_empty() {
                continue;
            }
            expand_segment(&segment, &mut nodes)?;
        }

        if nodes.is_empty() {
            return Err(Error::Empty);
        }
        Ok(NodeSet(nodes))
    }

    pub fn insert(&mut self, host: impl Into<String>) {
        self.0.insert(host.into());
    }

    pub fn contains(&self, host: &str) -> bool {
        self.0.contains(host)
    }

    /// The first `n` hosts in iteration order. Iteration order is not part
    /// of the public contract but is stable within one process run.
    pub fn take(&self, n: usize) -> NodeSet {
        NodeSet(self.0.iter().take(n).cloned().collect())
    }
}

impl fmt::Display for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", fold(&self.0))
    }
}

impl FromIterator<String> for NodeSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        NodeSet(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for NodeSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        NodeSet(iter.into_iter().map(str::to_owned).collect())
    }
}

impl Extend<String> for NodeSet {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for NodeSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl BitOr for &NodeSet {
    type Output = NodeSet;

    fn bitor(self, rhs: &NodeSet) -> NodeSet {
        NodeSet(self.0.union(&rhs.0).cloned().collect())
    }
}

impl BitAnd for &NodeSet {
    type Output = NodeSet;

    fn bitand(self, rhs: &NodeSet) -> NodeSet {
        NodeSet(self.0.intersection(&rhs.0).cloned().collect())
    }
}

impl Sub for &NodeSet {
    type Output = NodeSet;

    fn sub(self, rhs: &NodeSet) -> NodeSet {
        NodeSet(self.0.difference(&rhs.0).cloned().collect())
    }
}

impl BitXor for &NodeSet {
    type Output = NodeSet;

    fn bitxor(self, rhs: &NodeSet) -> NodeSet {
        NodeSet(self.0.symmetric_difference(&rhs.0).cloned().collect())
    }
}

impl BitOrAssign<&NodeSet> for NodeSet {
    fn bitor_assign(&mut self, rhs: &NodeSet) {
        self.0.extend(rhs.0.iter().cloned());
    }
}

impl SubAssign<&NodeSet> for NodeSet {
    fn sub_assign(&mut self, rhs: &NodeSet) {
        self.0.retain(|host| !rhs.0.contains(host));
    }
}

impl BitXorAssign<&NodeSet> for NodeSet {
    fn bitxor_assign(&mut self, rhs: &NodeSet) {
        *self = &*self ^ rhs;
    }
}

/// Split a host expression on the commas that sit outside bracket groups.
fn split_segments(expr: &str) -> Result<Vec<String>, Error> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for ch in expr.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::UnbalancedBrackets(expr.to_owned()))?;
                current.push(ch);
            }
            ',' if depth == 0 => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }

    if depth != 0 {
        return Err(Error::UnbalancedBrackets(expr.to_owned()));
    }
    segments.push(current);
    Ok(segments)
}

/// Expand the first bracket group of `segment` and recurse over the rest.
fn expand_segment(segment: &str, nodes: &mut BTreeSet<String>) -> Result<(), Error> {
    let Some(open) = segment.find('[') else {
        nodes.insert(segment.to_owned());
        return Ok(());
    };
    let close = segment[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| Error::UnbalancedBrackets(segment.to_owned()))?;

    let prefix = &segment[..open];
    let body = &segment[open + 1..close];
    let rest = &segment[close + 1..];

    if body.is_empty() {
        return Err(Error::InvalidRange(body.to_owned(), segment.to_owned()));
    }

    for part in body.split(',') {
        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (start, end),
            None => (part, part),
        };
        let width = padding_width(start).max(padding_width(end));
        let start_num: u64 = start
            .parse()
            .map_err(|_| Error::InvalidNumber(start.to_owned(), segment.to_owned()))?;
        let end_num: u64 = end
            .parse()
            .map_err(|_| Error::InvalidNumber(end.to_owned(), segment.to_owned()))?;
        if start_num > end_num {
            return Err(Error::InvalidRange(part.to_owned(), segment.to_owned()));
        }

        for num in start_num..=end_num {
            let expanded = format!("{prefix}{num:0width$}{rest}");
            expand_segment(&expanded, nodes)?;
        }
    }

    Ok(())
}

fn padding_width(number: &str) -> usize {
    if number.len() > 1 && number.starts_with('0') {
        number.len()
    } else {
        0
    }
}

/// Fold a set of names back into the compact bracket form.
fn fold(names: &BTreeSet<String>) -> String {
    use std::collections::BTreeMap;

    // Group the names by the text surrounding their last numeric run.
    let mut groups: BTreeMap<(String, String), Vec<(u64, usize, String)>> = BTreeMap::new();
    let mut tokens: Vec<String> = Vec::new();

    for name in names {
        match split_numeric_suffix(name) {
            Some((head, number, tail)) => {
                let width = padding_width(number);
                let value: u64 = match number.parse() {
                    Ok(value) => value,
                    Err(_) => {
                        tokens.push(name.clone());
                        continue;
                    }
                };
                groups
                    .entry((head.to_owned(), tail.to_owned()))
                    .or_default()
                    .push((value, width, number.to_owned()));
            }
            None => tokens.push(name.clone()),
        }
    }

    for ((head, tail), mut entries) in groups {
        if entries.len() == 1 {
            let (_, _, raw) = &entries[0];
            tokens.push(format!("{head}{raw}{tail}"));
            continue;
        }

        entries.sort();
        let mut ranges: Vec<String> = Vec::new();
        let mut run_start = entries[0].clone();
        let mut run_end = entries[0].clone();

        for entry in entries.into_iter().skip(1) {
            if entry.1 == run_end.1 && entry.0 == run_end.0 + 1 {
                run_end = entry;
            } else {
                ranges.push(format_range(&run_start, &run_end));
                run_start = entry.clone();
                run_end = entry;
            }
        }
        ranges.push(format_range(&run_start, &run_end));

        if ranges.len() == 1 && !ranges[0].contains('-') {
            tokens.push(format!("{head}{range}{tail}", range = ranges[0]));
        } else {
            tokens.push(format!("{head}[{ranges}]{tail}", ranges = ranges.join(",")));
        }
    }

    tokens.sort();
    tokens.join(",")
}

fn format_range(start: &(u64, usize, String), end: &(u64, usize, String)) -> String {
    if start.0 == end.0 {
        start.2.clone()
    } else {
        format!("{}-{}", start.2, end.2)
    }
}

/// Split `name` at its last run of ASCII digits, if any.
fn split_numeric_suffix(name: &str) -> Option<(&str, &str, &str)> {
    let bytes = name.as_bytes();
    let end = bytes.iter().rposition(|b| b.is_ascii_digit())? + 1;
    let start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    // Refuse absurdly long runs rather than overflowing the numeric fold.
    if end - start > 18 {
        return None;
    }
    Some((&name[..start], &name[start..end], &name[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(hosts: &[&str]) -> NodeSet {
        hosts.iter().copied().collect()
    }

    #[test]
    fn parse_single_host() {
        assert_eq!(NodeSet::parse("host1.example.com").unwrap(), set(&["host1.example.com"]));
    }

    #[test]
    fn parse_range_expands() {
        let nodes = NodeSet::parse("host[1-3].d").unwrap();
        assert_eq!(nodes, set(&["host1.d", "host2.d", "host3.d"]));
    }

    #[test]
    fn parse_range_with_list_and_padding() {
        let nodes = NodeSet::parse("host[01-03,10].d").unwrap();
        assert_eq!(nodes, set(&["host01.d", "host02.d", "host03.d", "host10.d"]));
    }

    #[test]
    fn parse_cartesian_groups() {
        let nodes = NodeSet::parse("r[1-2]s[1-2]").unwrap();
        assert_eq!(nodes, set(&["r1s1", "r1s2", "r2s1", "r2s2"]));
    }

    #[test]
    fn parse_comma_separated_segments() {
        let nodes = NodeSet::parse("host[1-2].d,web1.d").unwrap();
        assert_eq!(nodes, set(&["host1.d", "host2.d", "web1.d"]));
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(NodeSet::parse("  "), Err(Error::Empty));
    }

    #[test]
    fn parse_rejects_unbalanced_brackets() {
        assert!(matches!(NodeSet::parse("host[1-3.d"), Err(Error::UnbalancedBrackets(_))));
        assert!(matches!(NodeSet::parse("host1-3].d"), Err(Error::UnbalancedBrackets(_))));
    }

    #[test]
    fn parse_rejects_reversed_range() {
        assert!(matches!(NodeSet::parse("host[3-1]"), Err(Error::InvalidRange(..))));
    }

    #[test]
    fn parse_rejects_non_numeric_range() {
        assert!(matches!(NodeSet::parse("host[a-b]"), Err(Error::InvalidNumber(..))));
    }

    #[test]
    fn union_is_commutative_and_associative() {
        let a = set(&["a1", "a2"]);
        let b = set(&["a2", "b1"]);
        let c = set(&["c1"]);
        assert_eq!(&a | &b, &b | &a);
        assert_eq!(&(&a | &b) | &c, &a | &(&b | &c));
    }

    #[test]
    fn difference_matches_intersection_identity() {
        let a = set(&["a1", "a2", "a3"]);
        let b = set(&["a2", "b1"]);
        assert_eq!(&a - &b, &a - &(&a & &b));
    }

    #[test]
    fn symmetric_difference_identity() {
        let a = set(&["a1", "a2"]);
        let b = set(&["a2", "b1"]);
        assert_eq!(&a ^ &b, &(&a | &b) - &(&a & &b));
    }

    #[test]
    fn duplicates_absorbed() {
        let nodes = NodeSet::parse("host1,host1,host[1-2]").unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn display_folds_consecutive_numbers() {
        let nodes = NodeSet::parse("host[1-5]").unwrap();
        let nodes = &nodes - &set(&["host2"]);
        assert_eq!(nodes.to_string(), "host[1,3-5]");
    }

    #[test]
    fn display_preserves_padding() {
        let nodes = NodeSet::parse("host[01-03].d").unwrap();
        assert_eq!(nodes.to_string(), "host[01-03].d");
    }

    #[test]
    fn display_single_host_has_no_brackets() {
        assert_eq!(set(&["host1.d"]).to_string(), "host1.d");
    }

    #[test]
    fn display_mixes_folded_and_plain_names() {
        let nodes = set(&["db1", "db2", "standalone"]);
        assert_eq!(nodes.to_string(), "db[1-2],standalone");
    }

    #[test]
    fn display_round_trips_through_parse() {
        let nodes = NodeSet::parse("host[01-10].d,web[3-4]").unwrap();
        assert_eq!(NodeSet::parse(&nodes.to_string()).unwrap(), nodes);
    }

    #[test]
    fn take_is_stable_prefix() {
        let nodes = set(&["a", "b", "c"]);
        assert_eq!(nodes.take(2), set(&["a", "b"]));
    }
}
