/// Filter selecting which new processes to break on.
///
/// Both comparisons are case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchFilter {
    /// Executable file name the new process must have (e.g., `cmd.exe`).
    pub process_name: String,

    /// Text the command line of the new process must contain, if any.
    pub process_command: Option<String>,
}

impl WatchFilter {
    /// Creates a filter matching processes by executable file name only.
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            process_command: None,
        }
    }

    /// Additionally requires the command line to contain `command`.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.process_command = Some(command.into());
        self
    }

    /// Returns whether the given executable file name is the watched one.
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        file_name.to_uppercase() == self.process_name.to_uppercase()
    }

    /// Returns whether the given command line contains the watched command.
    ///
    /// Always true when the filter has no command.
    pub fn matches_command_line(&self, command_line: &str) -> bool {
        self.process_command.as_ref().is_none_or(|command| {
            command_line
                .to_uppercase()
                .contains(&command.to_uppercase())
        })
    }
}

/// Options of a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    /// Whether to output a line for every created process whose name doesn't
    /// match the filter.
    pub log_skipped: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { log_skipped: true }
    }
}

/// Extracts the executable file name from an `ImagePathName`.
///
/// Stray `"` delimiters around the path are ignored.
pub fn file_name_from_image_path(image_path: &str) -> &str {
    let path = image_path.trim_matches('"');

    path.rsplit('\\').next().unwrap_or(path)
}
