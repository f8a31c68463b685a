use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::nodeset::{self, NodeSet};

use super::hostexpr::{self, Tree};
use super::Backend;

#[derive(Debug, Display, Error)]
pub enum Error {
    /// Invalid query: {0}
    Grammar(#[from] hostexpr::Error),
    /// Invalid host expression: {0}
    Hosts(#[from] nodeset::Error),
    /// Failed to read known hosts file `{0}`: {1}
    Read(PathBuf, std::io::Error),
}

impl Error {
    pub fn is_parse(&self) -> bool {
        !matches!(self, Error::Read(..))
    }
}

/// Why a whole line was skipped while loading a known hosts file.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum SkipKind {
    /// empty line
    Empty,
    /// comment
    Comment,
    /// hashed
    Hashed,
    /// revoked
    Revoked,
}

/// Why a whole line was discarded as invalid.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum InvalidKind {
    /// not enough fields
    NotEnoughFields,
    /// unknown marker
    UnknownMarker,
}

/// A line that produced no host names: either skipped by design or
/// discarded as unparseable.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum LineIssue {
    /// skipped ({0})
    Skipped(SkipKind),
    /// discarded ({0})
    Invalid(InvalidKind),
}

/// Resolves host expressions, including `*`/`?` globs, against the universe
/// of host names loaded from the configured SSH known hosts files. The
/// result is always a subset of that universe.
pub struct KnownHostsQuery {
    files: Vec<PathBuf>,
    universe: Option<NodeSet>,
}

impl KnownHostsQuery {
    pub fn new(config: &Config) -> Self {
        KnownHostsQuery {
            files: config.knownhosts.files.clone(),
            universe: None,
        }
    }

    /// Parse one SSH known hosts line into `(kept, skipped)` host names.
    ///
    /// See `SSH_KNOWN_HOSTS FILE FORMAT` in `man sshd`. Glob-bearing
    /// patterns and IP literals always land in `skipped`.
    pub fn parse_line(line: &str) -> Result<(NodeSet, NodeSet), LineIssue> {
        let line = line.trim();
        if line.is_empty() {
            return Err(LineIssue::Skipped(SkipKind::Empty));
        }
        if line.starts_with('#') {
            return Err(LineIssue::Skipped(SkipKind::Comment));
        }
        if line.starts_with('|') {
            return Err(LineIssue::Skipped(SkipKind::Hashed));
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(LineIssue::Invalid(InvalidKind::NotEnoughFields));
        }

        let hosts_field = if line.starts_with('@') {
            if fields.len() < 4 {
                return Err(LineIssue::Invalid(InvalidKind::NotEnoughFields));
            }
            match fields[0] {
                "@cert-authority" => fields[1],
                "@revoked" => return Err(LineIssue::Skipped(SkipKind::Revoked)),
                _ => return Err(LineIssue::Invalid(InvalidKind::UnknownMarker)),
            }
        } else {
            fields[0]
        };

        Ok(Self::parse_line_hosts(hosts_field))
    }

    /// Split the comma-separated host list of a line into kept host names
    /// and skipped patterns.
    fn parse_line_hosts(hosts_field: &str) -> (NodeSet, NodeSet) {
        let mut kept = NodeSet::new();
        let mut skipped = NodeSet::new();

        for entry in hosts_field.split(',') {
            if entry.is_empty() {
                continue;
            }
            // A negation marker still names a valid host.
            let entry = entry.strip_prefix('!').unwrap_or(entry);
            // Bracketed `[host]:port` form.
            let entry = match entry.strip_prefix('[') {
                Some(rest) => rest.split(']').next().unwrap_or(rest),
                None => entry,
            };
            if entry.is_empty() {
                continue;
            }

            if entry.contains('*') || entry.contains('?') {
                skipped.insert(entry);
            } else if entry.parse::<IpAddr>().is_ok() {
                skipped.insert(entry);
            } else {
                kept.insert(entry);
            }
        }

        (kept, skipped)
    }

    fn load(&mut self) -> Result<&NodeSet, Error> {
        if self.universe.is_none() {
            let mut universe = NodeSet::new();
            for path in &self.files {
                let contents = std::fs::read_to_string(path)
                    .map_err(|err| Error::Read(path.clone(), err))?;
                let mut found = 0usize;
                for (lineno, line) in contents.lines().enumerate() {
                    match Self::parse_line(line) {
                        Ok((kept, skipped)) => {
                            if !skipped.is_empty() {
                                trace!(
                                    "Skipped patterns at line {} in known hosts file '{}': {skipped}",
                                    lineno + 1,
                                    path.display(),
                                );
                            }
                            found += kept.len();
                            universe |= &kept;
                        }
                        Err(LineIssue::Invalid(kind)) => warn!(
                            "Discarded invalid line {} ({kind}) in known hosts file '{}': {line}",
                            lineno + 1,
                            path.display(),
                        ),
                        Err(LineIssue::Skipped(kind)) => trace!(
                            "Skipped {kind} line {} in known hosts file '{}'",
                            lineno + 1,
                            path.display(),
                        ),
                    }
                }
                debug!("Loaded {found} hosts from '{}'", path.display());
            }
            self.universe = Some(universe);
        }
        Ok(self.universe.get_or_insert_with(NodeSet::new))
    }

    fn resolve(&mut self, query: &str) -> Result<NodeSet, Error> {
        let tree = Tree::parse(query, true)?;
        let universe = self.load()?.clone();

        let hosts: NodeSet = tree.evaluate(&mut |word| {
            let mut resolved = NodeSet::new();
            for pattern in NodeSet::parse(word)? {
                if pattern.contains('*') || pattern.contains('?') {
                    resolved.extend(
                        universe
                            .iter()
                            .filter(|host| glob_match(&pattern, host))
                            .cloned(),
                    );
                } else {
                    resolved.insert(pattern);
                }
            }
            Ok::<_, Error>(resolved)
        })?;

        // Wildcards cannot invent hosts: the result is capped by the
        // loaded universe.
        Ok(&hosts & &universe)
    }
}

#[async_trait]
impl Backend for KnownHostsQuery {
    async fn execute(&mut self, query: &str) -> Result<NodeSet, super::Error> {
        Ok(self.resolve(query)?)
    }
}

/// Shell-style glob match with `*` and `?`, anchored at both ends.
fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    // Iterative backtracking over the last `*` seen.
    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
