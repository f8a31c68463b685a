pub mod handlers;
pub mod local;
pub mod worker;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use displaydoc::Display;
use strum::{Display as StrumDisplay, EnumString};
use thiserror::Error;

use crate::config::Config;
use crate::nodeset::NodeSet;

#[derive(Debug, Display, Error, PartialEq)]
pub enum Error {
    /// No commands provided.
    NoCommands,
    /// An execution mode is required when multiple commands are provided.
    MissingMode,
    /// Invalid success threshold `{0}`, expected a value within [0.0, 1.0].
    InvalidThreshold(f64),
    /// Cannot target an empty host set.
    EmptyHosts,
    /// Invalid batch size `0`, expected a positive integer.
    ZeroBatchSize,
    /// Invalid batch ratio `{0}`, expected a value within [0.0, 1.0].
    InvalidBatchRatio(f64),
    /// Invalid state transition from `{0}` to `{1}`.
    InvalidTransition(State, State),
    /// Got an event for unknown host `{0}`.
    UnknownHost(String),
    /// Command mismatch: expected `{0}`, transport reported `{1}`.
    CommandMismatch(String, String),
    /// Host `{0}` was picked up with no queued command.
    EmptyQueue(String),
    /// No transport named `{0}` is available.
    UnknownTransport(String),
    /// Execution aborted by the operator.
    Aborted,
}

/// Execution mode of a multi-command run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, StrumDisplay, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    Sync,
    Async,
}

/// A command to execute, with its per-command timeout and the exit codes
/// considered successful. An empty `ok_codes` means any exit code is
/// success. Equality is by command text only.
#[derive(Clone, Debug)]
pub struct Command {
    text: String,
    pub timeout: Option<Duration>,
    pub ok_codes: Vec<i32>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Command {
            text: text.into(),
            timeout: None,
            ok_codes: vec![0],
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ok_codes(mut self, ok_codes: Vec<i32>) -> Self {
        self.ok_codes = ok_codes;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn accepts(&self, code: i32) -> bool {
        self.ok_codes.is_empty() || self.ok_codes.contains(&code)
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Command {}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Per-host execution state.
///
/// `scheduled` marks a host admitted to the upcoming wave, `running` that
/// the transport has dispatched the command. A successful host is reset to
/// `pending` before the next command of the sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, StrumDisplay, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum State {
    #[default]
    Pending,
    Scheduled,
    Running,
    Success,
    Failed,
    Timeout,
}

impl State {
    fn allowed(self) -> &'static [State] {
        match self {
            State::Pending => &[State::Scheduled, State::Running],
            State::Scheduled => &[State::Running],
            State::Running => &[State::Success, State::Failed, State::Timeout],
            State::Success => &[State::Pending],
            State::Failed | State::Timeout => &[],
        }
    }

    pub fn transition(&mut self, to: State) -> Result<(), Error> {
        if self.allowed().contains(&to) {
            *self = to;
            Ok(())
        } else {
            Err(Error::InvalidTransition(*self, to))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Failed | State::Timeout)
    }
}

/// Batch size specification: an absolute host count or a ratio of the
/// targeted hosts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BatchSize {
    Absolute(usize),
    Ratio(f64),
}

/// The hosts a run is aimed at, along with its batching policy.
#[derive(Clone, Debug)]
pub struct Target {
    hosts: NodeSet,
    batch_size: usize,
    batch_sleep: Duration,
}

impl Target {
    pub fn new(
        hosts: NodeSet,
        batch_size: Option<BatchSize>,
        batch_sleep: Option<Duration>,
    ) -> Result<Self, Error> {
        if hosts.is_empty() {
            return Err(Error::EmptyHosts);
        }

        let batch_size = match batch_size {
            None => hosts.len(),
            Some(BatchSize::Absolute(0)) => return Err(Error::ZeroBatchSize),
            Some(BatchSize::Absolute(size)) => size.min(hosts.len()),
            Some(BatchSize::Ratio(ratio)) => {
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(Error::InvalidBatchRatio(ratio));
                }
                ((hosts.len() as f64 * ratio).ceil() as usize).max(1)
            }
        };

        Ok(Target {
            hosts,
            batch_size,
            batch_sleep: batch_sleep.unwrap_or(Duration::ZERO),
        })
    }

    pub fn hosts(&self) -> &NodeSet {
        &self.hosts
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_sleep(&self) -> Duration {
        self.batch_sleep
    }

    /// The deterministic first slice of `batch_size` hosts.
    pub fn first_batch(&self) -> NodeSet {
        self.hosts.take(self.batch_size)
    }
}

/// Lifecycle notification from the transport. Delivery is serialized, so
/// the consumer never needs to lock its own state.
#[derive(Clone, Debug)]
pub enum Event {
    /// The command was picked up for execution on a host.
    Pickup { host: String, command: String },
    /// A chunk of standard output from a host.
    Stdout { host: String, chunk: Vec<u8> },
    /// A chunk of standard error from a host.
    Stderr { host: String, chunk: Vec<u8> },
    /// The command completed on a host.
    Exit {
        host: String,
        command: String,
        code: i32,
    },
    /// The per-command timeout expired on a host.
    Timeout { host: String },
    /// The transport failed to execute on a host.
    Error { host: String, message: String },
}

/// Contract the execution engine drives. The transport may be arbitrarily
/// parallel internally but must deliver events one at a time.
#[async_trait]
pub trait Transport: Send {
    /// Queue `command` for execution on every host of `hosts`.
    fn dispatch(&mut self, command: &Command, hosts: &NodeSet);

    /// The next lifecycle event, or `None` once every dispatched command
    /// has completed and no event remains.
    async fn next_event(&mut self) -> Option<Event>;

    /// Hosts grouped by identical output, for the final report.
    fn outputs(&self) -> Vec<(NodeSet, Vec<u8>)>;
}

/// Instantiate the configured transport and export its declared
/// environment variables into the process.
pub fn new(config: &Config) -> Result<Box<dyn Transport>, Error> {
    for (key, value) in config.transport_environment(&config.transport) {
        std::env::set_var(key, value);
    }

    match config.transport.as_str() {
        "local" => Ok(Box::new(local::LocalTransport::new())),
        name => Err(Error::UnknownTransport(name.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(n: usize) -> NodeSet {
        (1..=n).map(|i| format!("host{i}")).collect()
    }

    #[test]
    fn command_defaults_to_exit_zero() {
        let command = Command::new("id");
        assert!(command.accepts(0));
        assert!(!command.accepts(1));
    }

    #[test]
    fn empty_ok_codes_accept_everything() {
        let command = Command::new("id").with_ok_codes(Vec::new());
        assert!(command.accepts(0));
        assert!(command.accepts(127));
        assert!(command.accepts(-1));
    }

    #[test]
    fn command_equality_is_by_text_only() {
        let a = Command::new("id").with_timeout(Some(Duration::from_secs(5)));
        let b = Command::new("id").with_ok_codes(vec![0, 1]);
        assert_eq!(a, b);
        assert_ne!(a, Command::new("id -u"));
    }

    #[test]
    fn state_machine_accepts_the_documented_paths() {
        let mut state = State::default();
        assert_eq!(state, State::Pending);
        state.transition(State::Scheduled).unwrap();
        state.transition(State::Running).unwrap();
        state.transition(State::Success).unwrap();
        state.transition(State::Pending).unwrap();
        state.transition(State::Running).unwrap();
        state.transition(State::Failed).unwrap();
    }

    #[test]
    fn state_machine_rejects_illegal_transitions() {
        let mut state = State::Pending;
        assert_eq!(
            state.transition(State::Success),
            Err(Error::InvalidTransition(State::Pending, State::Success))
        );

        let mut state = State::Failed;
        assert!(state.transition(State::Pending).is_err());
        let mut state = State::Timeout;
        assert!(state.transition(State::Running).is_err());
        let mut state = State::Scheduled;
        assert!(state.transition(State::Timeout).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(State::Success.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(State::Timeout.is_terminal());
        assert!(!State::Pending.is_terminal());
        assert!(!State::Scheduled.is_terminal());
        assert!(!State::Running.is_terminal());
    }

    #[test]
    fn target_defaults_to_all_hosts() {
        let target = Target::new(hosts(5), None, None).unwrap();
        assert_eq!(target.batch_size(), 5);
        assert_eq!(target.first_batch().len(), 5);
    }

    #[test]
    fn absolute_batch_size_is_clamped() {
        let target = Target::new(hosts(5), Some(BatchSize::Absolute(100)), None).unwrap();
        assert_eq!(target.batch_size(), 5);
        let target = Target::new(hosts(5), Some(BatchSize::Absolute(2)), None).unwrap();
        assert_eq!(target.batch_size(), 2);
        assert_eq!(target.first_batch().len(), 2);
    }

    #[test]
    fn ratio_batch_size_rounds_up_to_at_least_one() {
        let target = Target::new(hosts(5), Some(BatchSize::Ratio(0.5)), None).unwrap();
        assert_eq!(target.batch_size(), 3);
        let target = Target::new(hosts(5), Some(BatchSize::Ratio(0.0)), None).unwrap();
        assert_eq!(target.batch_size(), 1);
        let target = Target::new(hosts(5), Some(BatchSize::Ratio(0.01)), None).unwrap();
        assert_eq!(target.batch_size(), 1);
    }

    #[test]
    fn invalid_batch_specs_are_rejected() {
        assert_eq!(
            Target::new(hosts(5), Some(BatchSize::Absolute(0)), None).unwrap_err(),
            Error::ZeroBatchSize
        );
        assert!(matches!(
            Target::new(hosts(5), Some(BatchSize::Ratio(1.5)), None),
            Err(Error::InvalidBatchRatio(_))
        ));
        assert_eq!(Target::new(NodeSet::new(), None, None).unwrap_err(), Error::EmptyHosts);
    }

    #[test]
    fn first_batch_is_a_subset_of_hosts() {
        let target = Target::new(hosts(10), Some(BatchSize::Absolute(4)), None).unwrap();
        let first = target.first_batch();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|host| target.hosts().contains(host)));
    }

    #[test]
    fn mode_parses_from_cli_names() {
        assert_eq!("sync".parse::<Mode>().unwrap(), Mode::Sync);
        assert_eq!("async".parse::<Mode>().unwrap(), Mode::Async);
        assert!("other".parse::<Mode>().is_err());
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let mut config = Config::default();
        config.transport = "teleport".to_owned();
        assert!(matches!(
            new(&config),
            Err(Error::UnknownTransport(name)) if name == "teleport"
        ));
    }
}
