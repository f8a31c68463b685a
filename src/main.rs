use std::panic::AssertUnwindSafe;

use muster::cli;

fn main() {
    let args: cli::Args = argh::from_env();

    let exit_code = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => {
            match std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(cli::run(args)))) {
                Ok(exit_code) => exit_code,
                Err(_) => {
                    eprintln!("Caught unexpected internal error");
                    99
                }
            }
        }
        Err(err) => {
            eprintln!("Failed to start the runtime: {err}");
            99
        }
    };

    std::process::exit(exit_code);
}
