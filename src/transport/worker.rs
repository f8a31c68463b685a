use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::nodeset::NodeSet;
use crate::report;

use super::handlers::Handler;
use super::{Command, Error, Event, Mode, Target, Transport};

/// Executes a sequence of commands against a target through a transport.
pub struct Worker {
    target: Target,
    transport: Box<dyn Transport>,
    pub commands: Vec<Command>,
    /// Global deadline for the whole execution; zero means unlimited.
    pub timeout: Duration,
    pub mode: Option<Mode>,
    /// Success-ratio threshold within [0, 1] the run must reach.
    pub success_threshold: f64,
}

impl Worker {
    pub fn new(target: Target, transport: Box<dyn Transport>) -> Self {
        Worker {
            target,
            transport,
            commands: Vec::new(),
            timeout: Duration::ZERO,
            mode: None,
            success_threshold: 1.0,
        }
    }

    /// Run all commands to completion and return the exit code: 0 on full
    /// success, 1 when the success threshold was met but not fully, 2
    /// otherwise.
    pub async fn execute(&mut self) -> Result<i32, Error> {
        if self.commands.is_empty() {
            return Err(Error::NoCommands);
        }
        if self.commands.len() > 1 && self.mode.is_none() {
            return Err(Error::MissingMode);
        }
        if !(0.0..=1.0).contains(&self.success_threshold) {
            return Err(Error::InvalidThreshold(self.success_threshold));
        }
        let mode = self.mode.unwrap_or(Mode::Sync);

        info!(
            "Executing {} command(s) on {} host(s) in {mode} mode",
            self.commands.len(),
            self.target.hosts().len(),
        );

        let mut handler = Handler::new(
            mode,
            &self.target,
            self.commands.clone(),
            self.success_threshold,
        );
        handler.start(self.transport.as_mut())?;

        let deadline = (!self.timeout.is_zero()).then(|| Instant::now() + self.timeout);
        let mut timed_out = false;

        loop {
            let event = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!("Execution interrupted by Ctrl+c/SIGINT");
                    handler.timeout_running();
                    return Err(Error::Aborted);
                }
                event = next_event(self.transport.as_mut(), deadline) => event,
            };

            match event {
                NextEvent::Deadline => {
                    warn!("Global timeout reached");
                    handler.timeout_running();
                    timed_out = true;
                    break;
                }
                NextEvent::Drained => break,
                NextEvent::Event(Event::Pickup { host, command }) => {
                    handler.on_pickup(&host, &command)?;
                }
                NextEvent::Event(Event::Stdout { .. }) | NextEvent::Event(Event::Stderr { .. }) => {
                    // Output is accumulated by the transport for grouping.
                }
                NextEvent::Event(Event::Exit {
                    host,
                    command,
                    code,
                }) => {
                    handler
                        .on_exit(self.transport.as_mut(), &host, &command, code)
                        .await?;
                }
                NextEvent::Event(Event::Timeout { host }) => {
                    handler.on_timeout(self.transport.as_mut(), &host).await?;
                }
                NextEvent::Event(Event::Error { host, message }) => {
                    handler
                        .on_error(self.transport.as_mut(), &host, &message)
                        .await?;
                }
            }
        }

        let progress = handler.progress();
        report::print_run(
            progress,
            &self.transport.outputs(),
            &self.commands,
            self.target.hosts().len(),
        );

        let counters = progress.counters();
        let total = self.target.hosts().len();
        let ratio = counters.success as f64 / total as f64;
        debug!(
            "Run finished: {}/{total} succeeded, {} failed, {} timed out",
            counters.success, counters.failed, counters.timeout,
        );

        let exit_code = if timed_out {
            2
        } else if (ratio - 1.0).abs() < f64::EPSILON {
            0
        } else if !handler.aborted() && ratio >= self.success_threshold {
            1
        } else {
            2
        };
        Ok(exit_code)
    }

    /// Lazy grouped results of the execution: hosts with identical output.
    pub fn results(&self) -> impl Iterator<Item = (NodeSet, Vec<u8>)> {
        self.transport.outputs().into_iter()
    }
}

enum NextEvent {
    Event(Event),
    Drained,
    Deadline,
}

async fn next_event(transport: &mut dyn Transport, deadline: Option<Instant>) -> NextEvent {
    let next = transport.next_event();
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, next).await {
            Ok(Some(event)) => NextEvent::Event(event),
            Ok(None) => NextEvent::Drained,
            Err(_) => NextEvent::Deadline,
        },
        None => match next.await {
            Some(event) => NextEvent::Event(event),
            None => NextEvent::Drained,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::super::BatchSize;
    use super::*;

    type DispatchLog = Arc<Mutex<Vec<(String, NodeSet)>>>;

    #[derive(Clone, Debug)]
    enum Outcome {
        Exit(i32),
        Timeout,
        Error(String),
        Hang,
    }

    /// Scripted in-memory transport: each dispatch immediately queues the
    /// per-host lifecycle events according to the script, in order.
    #[derive(Default)]
    struct FakeTransport {
        script: BTreeMap<String, VecDeque<Outcome>>,
        queue: VecDeque<Event>,
        outputs: BTreeMap<String, Vec<u8>>,
        dispatches: DispatchLog,
        hanging: usize,
    }

    impl FakeTransport {
        fn script(mut self, host: &str, outcomes: &[Outcome]) -> Self {
            self.script
                .insert(host.to_owned(), outcomes.iter().cloned().collect());
            self
        }

        fn log(&self) -> DispatchLog {
            self.dispatches.clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn dispatch(&mut self, command: &Command, hosts: &NodeSet) {
            self.dispatches
                .lock()
                .unwrap()
                .push((command.text().to_owned(), hosts.clone()));
            for host in hosts {
                self.queue.push_back(Event::Pickup {
                    host: host.clone(),
                    command: command.text().to_owned(),
                });
                let outcome = self
                    .script
                    .get_mut(host)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(Outcome::Exit(0));
                match outcome {
                    Outcome::Exit(code) => {
                        let chunk = if code == 0 { b"ok\n".to_vec() } else { b"ko\n".to_vec() };
                        self.outputs.entry(host.clone()).or_default().extend(&chunk);
                        self.queue.push_back(Event::Stdout {
                            host: host.clone(),
                            chunk,
                        });
                        self.queue.push_back(Event::Exit {
                            host: host.clone(),
                            command: command.text().to_owned(),
                            code,
                        });
                    }
                    Outcome::Timeout => self.queue.push_back(Event::Timeout { host: host.clone() }),
                    Outcome::Error(message) => self.queue.push_back(Event::Error {
                        host: host.clone(),
                        message,
                    }),
                    Outcome::Hang => self.hanging += 1,
                }
            }
        }

        async fn next_event(&mut self) -> Option<Event> {
            match self.queue.pop_front() {
                Some(event) => Some(event),
                None if self.hanging > 0 => {
                    std::future::pending::<()>().await;
                    None
                }
                None => None,
            }
        }

        fn outputs(&self) -> Vec<(NodeSet, Vec<u8>)> {
            let mut grouped: BTreeMap<Vec<u8>, NodeSet> = BTreeMap::new();
            for (host, output) in &self.outputs {
                grouped.entry(output.clone()).or_default().insert(host);
            }
            grouped.into_iter().map(|(output, hosts)| (hosts, output)).collect()
        }
    }

    fn hosts(n: usize) -> NodeSet {
        (1..=n).map(|i| format!("host{i}")).collect()
    }

    fn worker(transport: FakeTransport, n_hosts: usize, batch: Option<BatchSize>) -> Worker {
        let target = Target::new(hosts(n_hosts), batch, None).unwrap();
        Worker::new(target, Box::new(transport))
    }

    #[tokio::test]
    async fn rejects_empty_commands() {
        let mut worker = worker(FakeTransport::default(), 2, None);
        assert_eq!(worker.execute().await.unwrap_err(), Error::NoCommands);
    }

    #[tokio::test]
    async fn rejects_multiple_commands_without_mode() {
        let mut worker = worker(FakeTransport::default(), 2, None);
        worker.commands = vec![Command::new("one"), Command::new("two")];
        assert_eq!(worker.execute().await.unwrap_err(), Error::MissingMode);
    }

    #[tokio::test]
    async fn rejects_invalid_threshold() {
        let mut worker = worker(FakeTransport::default(), 2, None);
        worker.commands = vec![Command::new("one")];
        worker.success_threshold = 1.5;
        assert!(matches!(
            worker.execute().await.unwrap_err(),
            Error::InvalidThreshold(_)
        ));
    }

    #[tokio::test]
    async fn single_command_defaults_to_sync_and_succeeds() {
        let mut worker = worker(FakeTransport::default(), 3, None);
        worker.commands = vec![Command::new("id")];
        assert_eq!(worker.execute().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sync_threshold_pass_dispatches_all_commands() {
        // S4: 5 hosts, two ok commands, threshold 1.0: both commands are
        // dispatched everywhere and the run exits 0.
        let transport = FakeTransport::default();
        let log = transport.log();
        let mut worker = worker(transport, 5, None);
        worker.commands = vec![Command::new("cmd1"), Command::new("cmd2")];
        worker.mode = Some(Mode::Sync);
        worker.success_threshold = 1.0;
        assert_eq!(worker.execute().await.unwrap(), 0);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "cmd1");
        assert_eq!(log[0].1.len(), 5);
        assert_eq!(log[1].0, "cmd2");
        assert_eq!(log[1].1.len(), 5);
    }

    #[tokio::test]
    async fn sync_threshold_fail_stops_the_sequence() {
        // S5: command 1 fails on 3 of 5 hosts, threshold 0.5: ratio 0.4,
        // command 2 never dispatched, exit 2.
        let transport = FakeTransport::default()
            .script("host1", &[Outcome::Exit(1)])
            .script("host2", &[Outcome::Exit(1)])
            .script("host3", &[Outcome::Exit(1)]);
        let log = transport.log();
        let target = Target::new(hosts(5), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("cmd1"), Command::new("cmd2")];
        worker.mode = Some(Mode::Sync);
        worker.success_threshold = 0.5;

        assert_eq!(worker.execute().await.unwrap(), 2);
        let log = log.lock().unwrap();
        assert!(log.iter().all(|(command, _)| command == "cmd1"));
    }

    #[tokio::test]
    async fn sync_partial_success_above_threshold_exits_one() {
        let transport = FakeTransport::default().script("host1", &[Outcome::Exit(1)]);
        let target = Target::new(hosts(5), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("cmd1")];
        worker.success_threshold = 0.5;

        assert_eq!(worker.execute().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sync_next_wave_targets_only_successful_hosts() {
        let transport = FakeTransport::default().script("host2", &[Outcome::Exit(1)]);
        let log = transport.log();
        let target = Target::new(hosts(3), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("cmd1"), Command::new("cmd2")];
        worker.mode = Some(Mode::Sync);
        worker.success_threshold = 0.5;

        assert_eq!(worker.execute().await.unwrap(), 1);
        let log = log.lock().unwrap();
        assert_eq!(log[1].0, "cmd2");
        assert_eq!(log[1].1.to_string(), "host[1,3]");
    }

    #[tokio::test]
    async fn sync_batches_stage_hosts_one_at_a_time() {
        let transport = FakeTransport::default();
        let log = transport.log();
        let mut worker = worker(transport, 5, Some(BatchSize::Absolute(2)));
        worker.commands = vec![Command::new("cmd1")];
        assert_eq!(worker.execute().await.unwrap(), 0);

        // First the window of two, then one release per completion.
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0].1.len(), 2);
        assert!(log[1..].iter().all(|(_, hosts)| hosts.len() == 1));
    }

    #[tokio::test]
    async fn async_failed_host_short_circuits_its_pipeline() {
        // S6: host2 fails command 1; the others run both commands.
        let transport = FakeTransport::default().script("host2", &[Outcome::Exit(1)]);
        let log = transport.log();
        let target = Target::new(hosts(5), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("cmd1"), Command::new("cmd2")];
        worker.mode = Some(Mode::Async);
        worker.success_threshold = 0.5;

        // 4 of 5 hosts completed everything: threshold met, not fully.
        assert_eq!(worker.execute().await.unwrap(), 1);
        let log = log.lock().unwrap();
        let second: Vec<_> = log.iter().filter(|(command, _)| command == "cmd2").collect();
        assert_eq!(second.len(), 4);
        assert!(second.iter().all(|(_, hosts)| !hosts.contains("host2")));
    }

    #[tokio::test]
    async fn per_command_timeouts_exit_two() {
        // S7: every host times out on the only command.
        let mut transport = FakeTransport::default();
        for host in &hosts(5) {
            transport = transport.script(host, &[Outcome::Timeout]);
        }
        let target = Target::new(hosts(5), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("sleep 2")];

        assert_eq!(worker.execute().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn transport_errors_count_as_failures() {
        let transport =
            FakeTransport::default().script("host1", &[Outcome::Error("unreachable".to_owned())]);
        let target = Target::new(hosts(2), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("id")];

        assert_eq!(worker.execute().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn global_timeout_trips_exit_two() {
        let transport = FakeTransport::default().script("host1", &[Outcome::Hang]);
        let target = Target::new(hosts(2), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("id")];
        worker.timeout = Duration::from_millis(50);

        assert_eq!(worker.execute().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn zero_global_timeout_means_unlimited() {
        let mut worker = worker(FakeTransport::default(), 2, None);
        worker.commands = vec![Command::new("id")];
        worker.timeout = Duration::ZERO;
        assert_eq!(worker.execute().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ignored_exit_codes_treat_failures_as_success() {
        let transport = FakeTransport::default().script("host1", &[Outcome::Exit(42)]);
        let target = Target::new(hosts(2), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("id").with_ok_codes(Vec::new())];

        assert_eq!(worker.execute().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn results_group_hosts_with_identical_output() {
        let transport = FakeTransport::default().script("host1", &[Outcome::Exit(1)]);
        let target = Target::new(hosts(3), None, None).unwrap();
        let mut worker = Worker::new(target, Box::new(transport));
        worker.commands = vec![Command::new("id")];
        worker.execute().await.unwrap();

        let results: Vec<_> = worker.results().collect();
        assert_eq!(results.len(), 2);
        let (ko_hosts, _) = results
            .iter()
            .find(|(_, output)| output == b"ko\n")
            .unwrap();
        assert_eq!(ko_hosts.to_string(), "host1");
    }
}
