//! Event handlers implementing the two execution modes.
//!
//! The synchronous handler runs one command at a time as a barrier across
//! the whole host set, gated by the success threshold. The asynchronous
//! handler pipelines the command list independently per host. Both enforce
//! the batching window: hosts are released into execution `batch_size` at a
//! time, paced by `batch_sleep`.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tracing::{debug, warn};

use crate::nodeset::NodeSet;

use super::{Command, Error, Mode, State, Target, Transport};

/// Node counts of a run, derived from the per-host state table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub success: usize,
    pub failed: usize,
    pub timeout: usize,
}

/// Per-run bookkeeping owned by the handler: the host state table and the
/// per-command map of failed hosts. Surrendered to the reporter at close.
#[derive(Debug)]
pub struct Progress {
    states: BTreeMap<String, State>,
    failed_commands: BTreeMap<String, NodeSet>,
}

impl Progress {
    fn new(hosts: &NodeSet) -> Self {
        Progress {
            states: hosts
                .iter()
                .map(|host| (host.clone(), State::default()))
                .collect(),
            failed_commands: BTreeMap::new(),
        }
    }

    fn transition(&mut self, host: &str, to: State) -> Result<(), Error> {
        self.states
            .get_mut(host)
            .ok_or_else(|| Error::UnknownHost(host.to_owned()))?
            .transition(to)
    }

    fn record_failure(&mut self, command: &str, host: &str) {
        self.failed_commands
            .entry(command.to_owned())
            .or_default()
            .insert(host);
    }

    /// Move every still-running host to the terminal timeout state.
    fn timeout_running(&mut self) {
        for state in self.states.values_mut() {
            if *state == State::Running {
                *state = State::Timeout;
            }
        }
    }

    pub fn counters(&self) -> Counters {
        let mut counters = Counters::default();
        for state in self.states.values() {
            match state {
                State::Success => counters.success += 1,
                State::Failed => counters.failed += 1,
                State::Timeout => counters.timeout += 1,
                _ => {}
            }
        }
        counters
    }

    pub fn failed_commands(&self) -> &BTreeMap<String, NodeSet> {
        &self.failed_commands
    }

    /// Hosts currently in the given state.
    pub fn in_state(&self, wanted: State) -> NodeSet {
        self.states
            .iter()
            .filter(|(_, state)| **state == wanted)
            .map(|(host, _)| host.clone())
            .collect()
    }
}

/// Mode-selected handler driven by the worker's event loop.
pub enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl Handler {
    pub fn new(mode: Mode, target: &Target, commands: Vec<Command>, threshold: f64) -> Handler {
        match mode {
            Mode::Sync => Handler::Sync(SyncHandler::new(target, commands, threshold)),
            Mode::Async => Handler::Async(AsyncHandler::new(target, commands)),
        }
    }

    pub fn start(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        match self {
            Handler::Sync(handler) => handler.start(transport),
            Handler::Async(handler) => handler.start(transport),
        }
    }

    pub fn on_pickup(&mut self, host: &str, command: &str) -> Result<(), Error> {
        match self {
            Handler::Sync(handler) => handler.on_pickup(host, command),
            Handler::Async(handler) => handler.on_pickup(host, command),
        }
    }

    pub async fn on_exit(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
        command: &str,
        code: i32,
    ) -> Result<(), Error> {
        match self {
            Handler::Sync(handler) => handler.on_exit(transport, host, command, code).await,
            Handler::Async(handler) => handler.on_exit(transport, host, command, code).await,
        }
    }

    pub async fn on_timeout(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
    ) -> Result<(), Error> {
        match self {
            Handler::Sync(handler) => handler.on_timeout(transport, host).await,
            Handler::Async(handler) => handler.on_timeout(transport, host).await,
        }
    }

    pub async fn on_error(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
        message: &str,
    ) -> Result<(), Error> {
        match self {
            Handler::Sync(handler) => handler.on_error(transport, host, message).await,
            Handler::Async(handler) => handler.on_error(transport, host, message).await,
        }
    }

    /// Global deadline or operator abort: every running host times out,
    /// pending hosts stay pending.
    pub fn timeout_running(&mut self) {
        match self {
            Handler::Sync(handler) => handler.progress.timeout_running(),
            Handler::Async(handler) => handler.progress.timeout_running(),
        }
    }

    pub fn progress(&self) -> &Progress {
        match self {
            Handler::Sync(handler) => &handler.progress,
            Handler::Async(handler) => &handler.progress,
        }
    }

    pub fn aborted(&self) -> bool {
        match self {
            Handler::Sync(handler) => handler.aborted,
            Handler::Async(_) => false,
        }
    }
}

/// Barrier executor: at any moment at most one command of the sequence is
/// in flight across the host set. Each wave targets the hosts that
/// succeeded the previous command; the success threshold gates both the
/// next wave and the admission of further hosts into the current one.
pub struct SyncHandler {
    threshold: f64,
    batch_size: usize,
    batch_sleep: Duration,
    queue: VecDeque<Command>,
    current: Option<Command>,
    progress: Progress,
    wave_size: usize,
    wave_pending: VecDeque<String>,
    wave_success: NodeSet,
    wave_failures: usize,
    in_flight: usize,
    aborted: bool,
}

impl SyncHandler {
    fn new(target: &Target, commands: Vec<Command>, threshold: f64) -> Self {
        SyncHandler {
            threshold,
            batch_size: target.batch_size(),
            batch_sleep: target.batch_sleep(),
            queue: commands.into(),
            current: None,
            progress: Progress::new(target.hosts()),
            wave_size: target.hosts().len(),
            wave_pending: VecDeque::new(),
            wave_success: NodeSet::new(),
            wave_failures: 0,
            in_flight: 0,
            aborted: false,
        }
    }

    fn start(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let hosts = self.progress.in_state(State::Pending);
        self.start_wave(transport, hosts)
    }

    /// Begin the next wave: pop the next command and dispatch it on the
    /// first batch of `hosts`, staging the rest.
    fn start_wave(&mut self, transport: &mut dyn Transport, hosts: NodeSet) -> Result<(), Error> {
        let command = self.queue.pop_front().ok_or(Error::NoCommands)?;
        debug!("Starting wave for command: {command}");

        self.wave_size = hosts.len();
        self.wave_success = NodeSet::new();
        self.wave_failures = 0;

        let batch = hosts.take(self.batch_size);
        for host in &batch {
            self.progress.transition(host, State::Scheduled)?;
        }
        self.wave_pending = hosts
            .iter()
            .filter(|host| !batch.contains(host))
            .cloned()
            .collect();

        transport.dispatch(&command, &batch);
        self.in_flight = batch.len();
        self.current = Some(command);
        Ok(())
    }

    fn on_pickup(&mut self, host: &str, command: &str) -> Result<(), Error> {
        let current = self.current.as_ref().ok_or(Error::NoCommands)?;
        if current.text() != command {
            return Err(Error::CommandMismatch(
                current.text().to_owned(),
                command.to_owned(),
            ));
        }
        self.progress.transition(host, State::Running)
    }

    async fn on_exit(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
        command: &str,
        code: i32,
    ) -> Result<(), Error> {
        let ok = self
            .current
            .as_ref()
            .map(|current| current.accepts(code))
            .unwrap_or(false);

        if ok {
            self.progress.transition(host, State::Success)?;
            self.wave_success.insert(host);
        } else {
            debug!("Command failed on {host} with exit code {code}");
            self.progress.transition(host, State::Failed)?;
            self.progress.record_failure(command, host);
            self.wave_failures += 1;
        }
        self.finish_slot(transport).await
    }

    async fn on_timeout(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
    ) -> Result<(), Error> {
        self.progress.transition(host, State::Timeout)?;
        self.wave_failures += 1;
        self.finish_slot(transport).await
    }

    async fn on_error(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
        message: &str,
    ) -> Result<(), Error> {
        warn!("Execution error on {host}: {message}");
        self.progress.transition(host, State::Failed)?;
        if let Some(current) = &self.current {
            let command = current.text().to_owned();
            self.progress.record_failure(&command, host);
        }
        self.wave_failures += 1;
        self.finish_slot(transport).await
    }

    async fn finish_slot(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.admit_next(transport).await?;
        if self.in_flight == 0 && self.wave_pending.is_empty() {
            self.end_wave(transport)?;
        }
        Ok(())
    }

    /// Release the next staged host of the wave, unless the threshold has
    /// become unreachable, in which case the wave stops enlisting.
    async fn admit_next(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        if self.wave_pending.is_empty() {
            return Ok(());
        }
        if self.wave_failures as f64 > (1.0 - self.threshold) * self.wave_size as f64 {
            warn!("Success threshold is out of reach, not scheduling further hosts");
            self.aborted = true;
            self.wave_pending.clear();
            return Ok(());
        }

        if !self.batch_sleep.is_zero() {
            tokio::time::sleep(self.batch_sleep).await;
        }
        let Some(host) = self.wave_pending.pop_front() else {
            return Ok(());
        };
        self.progress.transition(&host, State::Scheduled)?;
        let command = self.current.clone().ok_or(Error::NoCommands)?;
        let single: NodeSet = [host].into_iter().collect();
        transport.dispatch(&command, &single);
        self.in_flight += 1;
        Ok(())
    }

    /// Wave complete: apply the threshold gate and either schedule the next
    /// command on the hosts that succeeded, or stop.
    fn end_wave(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let ratio = if self.wave_size == 0 {
            0.0
        } else {
            self.wave_success.len() as f64 / self.wave_size as f64
        };
        debug!(
            "Wave complete: {}/{} succeeded (ratio {ratio:.2})",
            self.wave_success.len(),
            self.wave_size,
        );

        if self.queue.is_empty() || self.aborted {
            return Ok(());
        }
        if ratio >= self.threshold && !self.wave_success.is_empty() {
            let next_hosts = self.wave_success.clone();
            for host in &next_hosts {
                self.progress.transition(host, State::Pending)?;
            }
            self.start_wave(transport, next_hosts)
        } else {
            warn!(
                "Success ratio {ratio:.2} below threshold {:.2}, aborting",
                self.threshold
            );
            self.aborted = true;
            Ok(())
        }
    }
}

/// Per-host pipeline executor: every host runs the command list from first
/// to last, failing fast on the first non-ok exit code, independently of
/// every other host.
pub struct AsyncHandler {
    batch_size: usize,
    batch_sleep: Duration,
    queues: BTreeMap<String, VecDeque<Command>>,
    current: BTreeMap<String, Command>,
    pending: VecDeque<String>,
    active: usize,
    progress: Progress,
}

impl AsyncHandler {
    fn new(target: &Target, commands: Vec<Command>) -> Self {
        let queues = target
            .hosts()
            .iter()
            .map(|host| (host.clone(), VecDeque::from(commands.clone())))
            .collect();
        AsyncHandler {
            batch_size: target.batch_size(),
            batch_sleep: target.batch_sleep(),
            queues,
            current: BTreeMap::new(),
            pending: VecDeque::new(),
            active: 0,
            progress: Progress::new(target.hosts()),
        }
    }

    fn start(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let hosts = self.progress.in_state(State::Pending);
        let batch = hosts.take(self.batch_size);
        self.pending = hosts
            .iter()
            .filter(|host| !batch.contains(host))
            .cloned()
            .collect();
        for host in &batch {
            self.start_host(transport, host)?;
        }
        Ok(())
    }

    /// Dispatch the first command of a host's queue, single-host workload.
    fn start_host(&mut self, transport: &mut dyn Transport, host: &str) -> Result<(), Error> {
        let queue = self
            .queues
            .get(host)
            .ok_or_else(|| Error::UnknownHost(host.to_owned()))?;
        let command = queue
            .front()
            .cloned()
            .ok_or_else(|| Error::EmptyQueue(host.to_owned()))?;

        self.progress.transition(host, State::Scheduled)?;
        let single: NodeSet = [host.to_owned()].into_iter().collect();
        transport.dispatch(&command, &single);
        self.active += 1;
        Ok(())
    }

    fn on_pickup(&mut self, host: &str, command: &str) -> Result<(), Error> {
        let queue = self
            .queues
            .get_mut(host)
            .ok_or_else(|| Error::UnknownHost(host.to_owned()))?;
        let expected = queue
            .pop_front()
            .ok_or_else(|| Error::EmptyQueue(host.to_owned()))?;
        if expected.text() != command {
            return Err(Error::CommandMismatch(
                expected.text().to_owned(),
                command.to_owned(),
            ));
        }
        self.current.insert(host.to_owned(), expected);
        self.progress.transition(host, State::Running)
    }

    async fn on_exit(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
        command: &str,
        code: i32,
    ) -> Result<(), Error> {
        let current = self
            .current
            .remove(host)
            .ok_or_else(|| Error::EmptyQueue(host.to_owned()))?;

        if current.accepts(code) {
            self.progress.transition(host, State::Success)?;
            let has_more = self
                .queues
                .get(host)
                .map(|queue| !queue.is_empty())
                .unwrap_or(false);
            if has_more {
                // Reset and pipeline the next command on this host alone.
                self.progress.transition(host, State::Pending)?;
                self.progress.transition(host, State::Scheduled)?;
                let next = self
                    .queues
                    .get(host)
                    .and_then(|queue| queue.front())
                    .cloned()
                    .ok_or_else(|| Error::EmptyQueue(host.to_owned()))?;
                let single: NodeSet = [host.to_owned()].into_iter().collect();
                transport.dispatch(&next, &single);
            } else {
                self.release_slot(transport).await?;
            }
        } else {
            debug!("Command failed on {host} with exit code {code}, not continuing");
            self.progress.transition(host, State::Failed)?;
            self.progress.record_failure(command, host);
            self.release_slot(transport).await?;
        }
        Ok(())
    }

    async fn on_timeout(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
    ) -> Result<(), Error> {
        self.current.remove(host);
        self.progress.transition(host, State::Timeout)?;
        self.release_slot(transport).await
    }

    async fn on_error(
        &mut self,
        transport: &mut dyn Transport,
        host: &str,
        message: &str,
    ) -> Result<(), Error> {
        warn!("Execution error on {host}: {message}");
        let current = self.current.remove(host);
        self.progress.transition(host, State::Failed)?;
        if let Some(command) = current {
            let text = command.text().to_owned();
            self.progress.record_failure(&text, host);
        }
        self.release_slot(transport).await
    }

    /// A host left the window: admit the next pending one, paced by the
    /// batch sleep.
    async fn release_slot(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        self.active = self.active.saturating_sub(1);
        if self.active >= self.batch_size {
            return Ok(());
        }
        if self.pending.is_empty() {
            return Ok(());
        }

        if !self.batch_sleep.is_zero() {
            tokio::time::sleep(self.batch_sleep).await;
        }
        if let Some(host) = self.pending.pop_front() {
            self.start_host(transport, &host)?;
        }
        Ok(())
    }
}
