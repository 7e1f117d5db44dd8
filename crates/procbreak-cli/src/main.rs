#![allow(missing_docs)]
#![allow(clippy::print_stderr)]

use procbreak_cli::{CliAction, CliOpts};

use tracing_subscriber::EnvFilter;

fn main() {
    let cli = CliOpts::parse_from_cmdline();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("PROCBREAK_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let res = match cli.action {
        CliAction::Watch {
            scenario,
            quiet,
            max_stops,
            process_name,
            process_command,
        } => procbreak_cli::evaluate_watch(
            scenario,
            quiet,
            max_stops,
            process_name,
            process_command,
            std::io::stdout(),
        ),
    };

    if let Err(e) = res {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}
