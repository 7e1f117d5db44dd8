/// Breaks on the initial thread of new processes.
#[derive(clap::Parser)]
#[clap(name = "procbreak")]
pub struct CliOpts {
    /// The command to run.
    #[clap(subcommand)]
    pub action: CliAction,
}

/// The command to run.
#[derive(clap::Subcommand)]
pub enum CliAction {
    /// Command to break on the initial thread of new processes matching a
    /// name (and optionally a command line).
    #[clap(visible_aliases = ["breakonprocess", "bop"])]
    Watch {
        /// Emulated target (KDL format).
        ///
        /// If it ends with `.kdl`, it is treated as a path to a scenario
        /// file. Otherwise it is directly parsed as inline KDL-formatted
        /// scenario.
        #[clap(short, long, value_name = "CONTENT/PATH")]
        scenario: String,

        /// Don't report the new processes which don't match.
        #[clap(short, long)]
        quiet: bool,

        /// Stop watching after this many initial threads were reached.
        #[clap(long, value_name = "N")]
        max_stops: Option<usize>,

        /// File name of the processes to break in (case-insensitive).
        process_name: String,

        /// Substring of the command line of the processes to break in
        /// (case-insensitive).
        process_command: Option<String>,
    },
}

impl CliOpts {
    /// Parses the CLI from the command-line.
    ///
    /// # Warning
    ///
    /// Exits on error.
    pub fn parse_from_cmdline() -> Self {
        <Self as clap::Parser>::parse()
    }
}
