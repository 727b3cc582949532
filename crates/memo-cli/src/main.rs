use anyhow::Result;
use clap::Parser;

mod args;
mod logging;
mod runner;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("memo: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let (argv, dynamic) = args::split_dynamic_args(std::env::args().collect())?;
    let cli = args::Cli::parse_from(argv);

    if cli.verbose || cli.log_file.is_some() {
        logging::init(cli.verbose, cli.log_file.as_deref())?;
    }

    let code = match cli.parallel {
        Some(workers) => runner::run_parallel(&cli, &dynamic, workers)?,
        None => runner::run_single(&cli)?,
    };

    if cli.kill && code != 0 {
        // deliver the failure to the parent script as well
        unsafe {
            libc::kill(libc::getppid(), libc::SIGKILL);
        }
    }

    Ok(code)
}
