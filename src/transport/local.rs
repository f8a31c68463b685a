//! Local process transport: runs each dispatched command on this machine,
//! once per targeted host, and feeds lifecycle events back over a channel.
//! A stand-in for an SSH fan-out library that honors the same contract.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::nodeset::NodeSet;

use super::{Command, Event, Transport};

pub struct LocalTransport {
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    in_flight: usize,
    outputs: BTreeMap<String, Vec<u8>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        LocalTransport {
            tx,
            rx,
            in_flight: 0,
            outputs: BTreeMap::new(),
        }
    }

    /// Track output for the final grouping and retire completed hosts.
    fn absorb(&mut self, event: &Event) {
        match event {
            Event::Stdout { host, chunk } | Event::Stderr { host, chunk } => {
                self.outputs
                    .entry(host.clone())
                    .or_default()
                    .extend_from_slice(chunk);
            }
            Event::Exit { .. } | Event::Timeout { .. } | Event::Error { .. } => {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            Event::Pickup { .. } => {}
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn dispatch(&mut self, command: &Command, hosts: &NodeSet) {
        for host in hosts {
            self.in_flight += 1;
            tokio::spawn(run_host(
                self.tx.clone(),
                host.clone(),
                command.text().to_owned(),
                command.timeout,
            ));
        }
    }

    async fn next_event(&mut self) -> Option<Event> {
        if self.in_flight == 0 {
            // All dispatched work completed: only drain what is queued.
            match self.rx.try_recv() {
                Ok(event) => {
                    self.absorb(&event);
                    Some(event)
                }
                Err(_) => None,
            }
        } else {
            let event = self.rx.recv().await?;
            self.absorb(&event);
            Some(event)
        }
    }

    fn outputs(&self) -> Vec<(NodeSet, Vec<u8>)> {
        let mut grouped: BTreeMap<&[u8], NodeSet> = BTreeMap::new();
        for (host, output) in &self.outputs {
            grouped.entry(output.as_slice()).or_default().insert(host);
        }
        grouped
            .into_iter()
            .map(|(output, hosts)| (hosts, output.to_vec()))
            .collect()
    }
}

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
}

async fn run_host(
    tx: mpsc::UnboundedSender<Event>,
    host: String,
    text: String,
    timeout: Option<Duration>,
) {
    let _ = tx.send(Event::Pickup {
        host: host.clone(),
        command: text.clone(),
    });

    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&text)
        .env("MUSTER_HOST", &host)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            let _ = tx.send(Event::Error {
                host,
                message: err.to_string(),
            });
            return;
        }
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let wait = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => WaitOutcome::Exited(result),
                Err(_) => {
                    // Killing the child closes its pipes, so the
                    // concurrent reads below terminate as well.
                    let _ = child.kill().await;
                    WaitOutcome::TimedOut
                }
            },
            None => WaitOutcome::Exited(child.wait().await),
        }
    };
    let (outcome, stdout_buf, stderr_buf) = tokio::join!(wait, read_all(stdout), read_all(stderr));

    if !stdout_buf.is_empty() {
        let _ = tx.send(Event::Stdout {
            host: host.clone(),
            chunk: stdout_buf,
        });
    }
    if !stderr_buf.is_empty() {
        let _ = tx.send(Event::Stderr {
            host: host.clone(),
            chunk: stderr_buf,
        });
    }

    match outcome {
        WaitOutcome::TimedOut => {
            trace!("Command timed out on {host}");
            let _ = tx.send(Event::Timeout { host });
        }
        WaitOutcome::Exited(Ok(status)) => {
            let _ = tx.send(Event::Exit {
                host,
                command: text,
                code: status.code().unwrap_or(-1),
            });
        }
        WaitOutcome::Exited(Err(err)) => {
            let _ = tx.send(Event::Error {
                host,
                message: err.to_string(),
            });
        }
    }
}

async fn read_all(pipe: Option<impl AsyncRead + Unpin>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer).await;
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(host: &str) -> NodeSet {
        [host].into_iter().collect()
    }

    async fn drain(transport: &mut LocalTransport) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = transport.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn successful_command_emits_pickup_and_exit() {
        let mut transport = LocalTransport::new();
        transport.dispatch(&Command::new("true"), &single("host1"));

        let events = drain(&mut transport).await;
        assert!(matches!(&events[0], Event::Pickup { host, .. } if host == "host1"));
        assert!(matches!(
            events.last(),
            Some(Event::Exit { code: 0, .. })
        ));
    }

    #[tokio::test]
    async fn exit_codes_are_propagated() {
        let mut transport = LocalTransport::new();
        transport.dispatch(&Command::new("exit 3"), &single("host1"));

        let events = drain(&mut transport).await;
        assert!(matches!(events.last(), Some(Event::Exit { code: 3, .. })));
    }

    #[tokio::test]
    async fn per_command_timeout_kills_and_reports() {
        let mut transport = LocalTransport::new();
        let command = Command::new("sleep 5").with_timeout(Some(Duration::from_millis(50)));
        transport.dispatch(&command, &single("host1"));

        let events = drain(&mut transport).await;
        assert!(matches!(events.last(), Some(Event::Timeout { host }) if host == "host1"));
    }

    #[tokio::test]
    async fn identical_outputs_are_grouped() {
        let mut transport = LocalTransport::new();
        let hosts: NodeSet = ["host1", "host2"].into_iter().collect();
        transport.dispatch(&Command::new("echo same"), &hosts);
        drain(&mut transport).await;

        let outputs = transport.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0.len(), 2);
        assert_eq!(outputs[0].1, b"same\n");
    }

    #[tokio::test]
    async fn per_host_environment_distinguishes_outputs() {
        let mut transport = LocalTransport::new();
        let hosts: NodeSet = ["host1", "host2"].into_iter().collect();
        transport.dispatch(&Command::new("printf '%s' \"$MUSTER_HOST\""), &hosts);
        drain(&mut transport).await;

        let outputs = transport.outputs();
        assert_eq!(outputs.len(), 2);
    }
}
