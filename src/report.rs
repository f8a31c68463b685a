//! Final run report. Purely presentational; nothing here feeds back into
//! control flow.

use crate::nodeset::NodeSet;
use crate::transport::handlers::Progress;
use crate::transport::Command;

const SHORT_COMMAND_LENGTH: usize = 35;

pub fn print_run(
    progress: &Progress,
    outputs: &[(NodeSet, Vec<u8>)],
    commands: &[Command],
    total: usize,
) {
    print_outputs(outputs);
    print_failures(progress, total);
    if commands.len() > 1 {
        print_success_summary(progress, total);
    }
}

/// One block per group of hosts that produced identical output.
fn print_outputs(outputs: &[(NodeSet, Vec<u8>)]) {
    let mut any = false;
    for (hosts, output) in outputs {
        if output.is_empty() {
            continue;
        }
        any = true;
        println!("===== NODE GROUP =====");
        println!("({}) {hosts}", hosts.len());
        println!("----- OUTPUT -----");
        println!("{}", String::from_utf8_lossy(output).trim_end());
    }
    if any {
        println!("================");
    } else {
        println!("===== NO OUTPUT =====");
    }
}

fn print_failures(progress: &Progress, total: usize) {
    for (command, hosts) in progress.failed_commands() {
        if hosts.is_empty() {
            continue;
        }
        print_ratio_line(
            hosts.len(),
            total,
            &format!(
                "of nodes failed to execute command '{}'",
                short_command(command)
            ),
            Some(hosts),
        );
    }

    let timeout = progress.counters().timeout;
    if timeout > 0 {
        print_ratio_line(timeout, total, "of nodes timed out", None);
    }
}

fn print_success_summary(progress: &Progress, total: usize) {
    let success = progress.counters().success;
    let hosts = (success > 0 && success < total)
        .then(|| progress.in_state(crate::transport::State::Success));
    print_ratio_line(
        success,
        total,
        "of nodes successfully executed all commands",
        hosts.as_ref(),
    );
}

fn print_ratio_line(num: usize, total: usize, message: &str, hosts: Option<&NodeSet>) {
    let percent = if total == 0 {
        0.0
    } else {
        num as f64 / total as f64 * 100.0
    };
    match hosts {
        Some(hosts) => println!("{percent:.1}% ({num}/{total}) {message}: {hosts}"),
        None => println!("{percent:.1}% ({num}/{total}) {message}"),
    }
}

/// Shorten a long command, omitting its central part.
fn short_command(command: &str) -> String {
    if command.len() <= SHORT_COMMAND_LENGTH {
        return command.to_owned();
    }
    let sublen = (SHORT_COMMAND_LENGTH - 3) / 2;
    format!("{}...{}", &command[..sublen], &command[command.len() - sublen..])
}
