use std::collections::BTreeMap;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use displaydoc::Display;
use itertools::Itertools;
use strum::EnumString;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::backend::Registry;
use crate::config::{self, Config};
use crate::nodeset::NodeSet;
use crate::query::{self, Query};
use crate::transport::worker::Worker;
use crate::transport::{self, BatchSize, Command, Mode, Target};

const OUTPUT_SEPARATOR: &str = "_____FORMATTED_OUTPUT_____";
const CONFIRMATION_ATTEMPTS: usize = 10;

const INTERACTIVE_BANNER: &str = "\
===== Muster interactive shell =====
# Type exit or press Ctrl+d to leave.
#     hosts:   print the targeted hosts
#     results: print the grouped outputs of the execution
#     help:    print this help message
";

#[derive(Debug, Display, Error)]
pub enum Error {
    /// Insufficient privileges, run with sudo.
    NotRoot,
    /// Unable to determine the real user, logged in as root?
    NoRealUser,
    /// {0}
    Config(#[from] config::Error),
    /// Failed to open log file `{0}`: {1}
    LogFile(PathBuf, std::io::Error),
    /// -m/--mode is required when there are multiple commands.
    ModeRequired,
    /// -i/--interactive can be used only with one command.
    InteractiveSingleCommand,
    /// -o/--output can be used only with one command.
    OutputSingleCommand,
    /// Invalid success percentage `{0}`, expected a value in 0-100.
    InvalidPercentage(u8),
    /// Not in a TTY but neither --dry-run nor --force were specified.
    NotATty,
    /// Failed to serialize output: {0}
    Serialize(#[from] serde_json::Error),
    /// {0}
    Query(#[from] query::Error),
    /// {0}
    Transport(#[from] transport::Error),
    /// Execution interrupted, aborting.
    Abort,
}

impl Error {
    /// Map an error to the process exit code. Exit 2 is reserved for the
    /// run outcome the worker computes itself and for argument misuse;
    /// anything else failing during the execution phase is unexpected.
    pub fn exit_code(&self) -> i32 {
        use transport::Error as TransportError;
        match self {
            Error::NotRoot
            | Error::NoRealUser
            | Error::Config(_)
            | Error::LogFile(..)
            | Error::Transport(TransportError::UnknownTransport(_)) => 3,
            Error::ModeRequired
            | Error::InteractiveSingleCommand
            | Error::OutputSingleCommand
            | Error::InvalidPercentage(_) => 2,
            Error::Abort | Error::Transport(TransportError::Aborted) => 98,
            _ => 99,
        }
    }
}

/// Machine-readable output format for single-command runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Txt,
    Json,
}

/// Execute commands on a fleet of hosts selected by a composable query.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// configuration file path
    #[argh(option, short = 'c', default = "config::DEFAULT_PATH.into()")]
    pub config: PathBuf,

    /// global timeout in whole seconds for the whole execution, 0 means
    /// unlimited
    #[argh(option, default = "0")]
    pub global_timeout: u64,

    /// timeout in seconds for the execution of every command on each host
    #[argh(option, short = 't')]
    pub timeout: Option<u64>,

    /// execution mode, sync or async; required with multiple commands
    #[argh(option, short = 'm')]
    pub mode: Option<Mode>,

    /// percentage threshold to consider an execution unit successful, 0-100
    #[argh(option, short = 'p', default = "100")]
    pub success_percentage: u8,

    /// sliding batch size, absolute (10) or percentage (50%)
    #[argh(option, short = 'b', from_str_fn(parse_batch_size))]
    pub batch_size: Option<BatchSize>,

    /// seconds to sleep before starting execution on the next host when
    /// batching
    #[argh(option, short = 's')]
    pub batch_sleep: Option<f64>,

    /// treat any executed command as successful, ignoring exit codes
    #[argh(switch, short = 'x')]
    pub ignore_exit_codes: bool,

    /// output format, txt or json; single-command runs only
    #[argh(option, short = 'o')]
    pub output: Option<OutputFormat>,

    /// drop into an interactive shell after the execution; single-command
    /// runs only
    #[argh(switch, short = 'i')]
    pub interactive: bool,

    /// force the execution without confirmation of the affected hosts
    #[argh(switch)]
    pub force: bool,

    /// do not execute any command, just resolve and print the hosts
    #[argh(switch)]
    pub dry_run: bool,

    /// override the default backend selected in the configuration file
    #[argh(option)]
    pub backend: Option<String>,

    /// override the transport selected in the configuration file
    #[argh(option)]
    pub transport: Option<String>,

    /// set the log level to debug
    #[argh(switch, short = 'd')]
    pub debug: bool,

    /// set the log level to trace
    #[argh(switch)]
    pub trace: bool,

    /// hosts selection query
    #[argh(positional)]
    pub query: String,

    /// commands to execute; with none, --dry-run is implied
    #[argh(positional)]
    pub commands: Vec<String>,
}

/// Validator for the -b/--batch-size argument.
fn parse_batch_size(value: &str) -> Result<BatchSize, String> {
    if let Some(percentage) = value.strip_suffix('%') {
        let percentage: u32 = percentage
            .parse()
            .map_err(|_| format!("{value} is not a valid percentage, expected 0%-100%"))?;
        if percentage > 100 {
            return Err(format!("{value} is not a valid percentage, expected 0%-100%"));
        }
        Ok(BatchSize::Ratio(f64::from(percentage) / 100.0))
    } else {
        let size: usize = value
            .parse()
            .map_err(|_| format!("{value} is not a valid value, expected a positive integer"))?;
        if size == 0 {
            return Err(format!("{value} is not a valid value, expected a positive integer"));
        }
        Ok(BatchSize::Absolute(size))
    }
}

/// CLI entry point: run and reduce every failure to an exit code.
pub async fn run(mut args: Args) -> i32 {
    let (config, user) = match setup(&mut args) {
        Ok(setup) => setup,
        Err(err) => {
            stderr(&err.to_string());
            return err.exit_code();
        }
    };
    info!("muster called by user '{user}' with args: {args:?}");

    match execute(args, config).await {
        Ok(exit_code) => exit_code,
        Err(err) => {
            stderr(&err.to_string());
            error!("Failed to execute: {err}");
            err.exit_code()
        }
    }
}

/// Pre-flight: privileges, configuration, overrides and logging.
fn setup(args: &mut Args) -> Result<(Config, String), Error> {
    let user = running_user()?;
    let mut config = Config::load(&args.config)?;
    config.validate()?;

    if let Some(backend) = &args.backend {
        config.default_backend = Some(backend.clone());
    }
    if let Some(transport) = &args.transport {
        config.transport = transport.clone();
    }
    if args.commands.is_empty() {
        args.dry_run = true;
    }

    if let Some(log_file) = &config.log_file {
        setup_logging(log_file, args.debug, args.trace)?;
    }
    Ok((config, user))
}

/// Ensure the process runs as root and the original invoking user is
/// discoverable from the session.
fn running_user() -> Result<String, Error> {
    if std::env::var("USER").as_deref() != Ok("root") {
        return Err(Error::NotRoot);
    }
    match std::env::var("SUDO_USER").ok().as_deref() {
        None | Some("root") => Err(Error::NoRealUser),
        Some(user) => Ok(user.to_owned()),
    }
}

fn setup_logging(log_file: &PathBuf, debug: bool, trace: bool) -> Result<(), Error> {
    if let Some(dir) = log_file.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|err| Error::LogFile(log_file.clone(), err))?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|err| Error::LogFile(log_file.clone(), err))?;

    let level = if trace {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
        .try_init();
    Ok(())
}

fn validate(args: &Args) -> Result<(), Error> {
    if args.commands.len() > 1 {
        if args.mode.is_none() {
            return Err(Error::ModeRequired);
        }
        if args.interactive {
            return Err(Error::InteractiveSingleCommand);
        }
        if args.output.is_some() {
            return Err(Error::OutputSingleCommand);
        }
    }
    if args.success_percentage > 100 {
        return Err(Error::InvalidPercentage(args.success_percentage));
    }
    Ok(())
}

async fn execute(args: Args, config: Config) -> Result<i32, Error> {
    validate(&args)?;
    if args.ignore_exit_codes {
        stderr("IGNORE EXIT CODES mode enabled, all commands executed will be considered successful");
    }

    let registry = Registry::with_builtins().map_err(query::Error::Backend)?;
    let hosts = Query::new(&config, &registry).execute(&args.query).await?;

    let Some(hosts) = confirm_hosts(&args, hosts)? else {
        return Ok(0);
    };

    let batch_sleep = args.batch_sleep.map(Duration::from_secs_f64);
    let target = Target::new(hosts.clone(), args.batch_size, batch_sleep)?;
    let transport = transport::new(&config)?;

    let mut worker = Worker::new(target, transport);
    let ok_codes = if args.ignore_exit_codes {
        Vec::new()
    } else {
        vec![0]
    };
    worker.commands = args
        .commands
        .iter()
        .map(|text| {
            Command::new(text)
                .with_timeout(args.timeout.map(Duration::from_secs))
                .with_ok_codes(ok_codes.clone())
        })
        .collect();
    worker.timeout = Duration::from_secs(args.global_timeout);
    worker.mode = args.mode;
    worker.success_threshold = f64::from(args.success_percentage) / 100.0;

    let exit_code = worker.execute().await?;

    if args.interactive {
        interactive_loop(&worker, &hosts, exit_code);
    } else if let Some(format) = args.output {
        println!("{OUTPUT_SEPARATOR}");
        print_output(format, &worker)?;
    }
    Ok(exit_code)
}

/// Resolve the confirmation workflow. Returns `None` when the run should
/// stop cleanly (no hosts, dry-run).
fn confirm_hosts(args: &Args, hosts: NodeSet) -> Result<Option<NodeSet>, Error> {
    if hosts.is_empty() {
        stderr("No hosts found that matches the query");
        return Ok(None);
    }

    stderr(&format!("{} hosts will be targeted:", hosts.len()));
    stderr(&hosts.to_string());

    if args.dry_run {
        stderr("DRY-RUN mode enabled, aborting");
        return Ok(None);
    }
    if args.force {
        stderr("FORCE mode enabled, continuing without confirmation");
        return Ok(Some(hosts));
    }
    if !std::io::stdout().is_terminal() {
        return Err(Error::NotATty);
    }

    let stdin = std::io::stdin();
    for _ in 0..CONFIRMATION_ATTEMPTS {
        eprint!("Confirm to continue [y/n]? ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).is_err() {
            break;
        }
        match answer.trim() {
            "y" | "Y" => return Ok(Some(hosts)),
            "n" | "N" => return Err(Error::Abort),
            _ => continue,
        }
    }
    stderr("Got invalid answers, aborting");
    Err(Error::Abort)
}

/// Print the execution results in the requested machine-readable format.
fn print_output(format: OutputFormat, worker: &Worker) -> Result<(), Error> {
    let results: Vec<(NodeSet, Vec<u8>)> = worker.results().collect();
    match format {
        OutputFormat::Txt => {
            for line in format_txt(&results) {
                println!("{line}");
            }
        }
        OutputFormat::Json => println!("{}", format_json(&results)?),
    }
    Ok(())
}

/// `host: line` rows, sorted by host.
fn format_txt(results: &[(NodeSet, Vec<u8>)]) -> Vec<String> {
    results
        .iter()
        .flat_map(|(hosts, output)| {
            let output = String::from_utf8_lossy(output).trim_end().to_owned();
            hosts
                .iter()
                .map(move |host| {
                    output
                        .lines()
                        .map(|line| format!("{host}: {line}"))
                        .join("\n")
                })
                .collect::<Vec<_>>()
        })
        .sorted()
        .collect()
}

/// One JSON object mapping each host to its full output.
fn format_json(results: &[(NodeSet, Vec<u8>)]) -> Result<String, Error> {
    let mut object: BTreeMap<&String, String> = BTreeMap::new();
    for (hosts, output) in results {
        for host in hosts {
            object.insert(host, String::from_utf8_lossy(output).into_owned());
        }
    }
    Ok(serde_json::to_string_pretty(&object)?)
}

/// Minimal post-execution inspection loop.
fn interactive_loop(worker: &Worker, hosts: &NodeSet, exit_code: i32) {
    println!("{INTERACTIVE_BANNER}");
    println!("# exit code: {exit_code}");

    let stdin = std::io::stdin();
    loop {
        print!("muster> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        match line.trim() {
            "hosts" => println!("{hosts}"),
            "results" | "outputs" => {
                for (hosts, output) in worker.results() {
                    println!("{hosts}");
                    println!("{}", String::from_utf8_lossy(&output).trim_end());
                    println!("-----");
                }
            }
            "help" | "h" => println!("{INTERACTIVE_BANNER}"),
            "exit" | "quit" => break,
            "" => {}
            other => println!("Unknown command '{other}', try help"),
        }
    }
}

/// Print a message to stderr and flush.
fn stderr(message: &str) {
    eprintln!("{message}");
    let _ = std::io::stderr().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(commands: &[&str]) -> Args {
        Args {
            config: config::DEFAULT_PATH.into(),
            global_timeout: 0,
            timeout: None,
            mode: None,
            success_percentage: 100,
            batch_size: None,
            batch_sleep: None,
            ignore_exit_codes: false,
            output: None,
            interactive: false,
            force: false,
            dry_run: false,
            backend: None,
            transport: None,
            debug: false,
            trace: false,
            query: "D{host1}".to_owned(),
            commands: commands.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn batch_size_parses_absolute_and_percentage() {
        assert_eq!(parse_batch_size("10").unwrap(), BatchSize::Absolute(10));
        assert_eq!(parse_batch_size("50%").unwrap(), BatchSize::Ratio(0.5));
        assert_eq!(parse_batch_size("100%").unwrap(), BatchSize::Ratio(1.0));
    }

    #[test]
    fn batch_size_rejects_invalid_values() {
        assert!(parse_batch_size("0").is_err());
        assert!(parse_batch_size("-1").is_err());
        assert!(parse_batch_size("101%").is_err());
        assert!(parse_batch_size("ten").is_err());
    }

    #[test]
    fn multiple_commands_require_a_mode() {
        let err = validate(&args(&["one", "two"])).unwrap_err();
        assert!(matches!(err, Error::ModeRequired));
    }

    #[test]
    fn interactive_is_single_command_only() {
        let mut invalid = args(&["one", "two"]);
        invalid.mode = Some(Mode::Sync);
        invalid.interactive = true;
        assert!(matches!(
            validate(&invalid),
            Err(Error::InteractiveSingleCommand)
        ));
    }

    #[test]
    fn output_is_single_command_only() {
        let mut invalid = args(&["one", "two"]);
        invalid.mode = Some(Mode::Sync);
        invalid.output = Some(OutputFormat::Json);
        assert!(matches!(validate(&invalid), Err(Error::OutputSingleCommand)));
    }

    #[test]
    fn single_command_needs_no_mode() {
        assert!(validate(&args(&["one"])).is_ok());
    }

    #[test]
    fn output_format_parses() {
        assert_eq!("txt".parse::<OutputFormat>().unwrap(), OutputFormat::Txt);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        assert_eq!(Error::NotRoot.exit_code(), 3);
        assert_eq!(Error::Config(config::Error::MissingLogFile).exit_code(), 3);
        assert_eq!(
            Error::Transport(transport::Error::UnknownTransport("teleport".into())).exit_code(),
            3
        );
        assert_eq!(Error::ModeRequired.exit_code(), 2);
        assert_eq!(Error::InteractiveSingleCommand.exit_code(), 2);
        assert_eq!(Error::OutputSingleCommand.exit_code(), 2);
        assert_eq!(Error::InvalidPercentage(150).exit_code(), 2);
        assert_eq!(Error::Abort.exit_code(), 98);
        assert_eq!(Error::Transport(transport::Error::Aborted).exit_code(), 98);
        assert_eq!(
            Error::Transport(transport::Error::UnknownHost("h".into())).exit_code(),
            99
        );
        assert_eq!(Error::NotATty.exit_code(), 99);
        assert_eq!(Error::Query(query::Error::EmptyQuery).exit_code(), 99);
    }

    #[test]
    fn txt_format_prefixes_each_line_with_the_host() {
        let results = vec![
            (
                ["host1", "host2"].into_iter().collect::<NodeSet>(),
                b"line1\nline2\n".to_vec(),
            ),
            (["host3"].into_iter().collect::<NodeSet>(), b"other\n".to_vec()),
        ];
        let lines = format_txt(&results);
        assert_eq!(
            lines,
            vec![
                "host1: line1\nhost1: line2",
                "host2: line1\nhost2: line2",
                "host3: other",
            ]
        );
    }

    #[test]
    fn json_format_maps_hosts_to_their_output() {
        let results = vec![(
            ["host1"].into_iter().collect::<NodeSet>(),
            b"out\n".to_vec(),
        )];
        let json = format_json(&results).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["host1"], "out\n");
    }
}
