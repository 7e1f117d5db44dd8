/// Emulated target, and the process creations happening on it.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct ScenarioConfig {
    /// Whether to report the new processes which don't match.
    #[knus(child, default = true, unwrap(argument))]
    pub log_skipped: bool,

    /// Processes created on the target, in order.
    #[knus(children(name = "process"))]
    pub processes: Vec<ScenarioProcess>,
}

/// Process created on the emulated target.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct ScenarioProcess {
    /// Path of the executable image.
    #[knus(argument)]
    pub image_path: String,

    /// Command line of the process.
    ///
    /// Defaults to the image path.
    #[knus(property)]
    pub command_line: Option<String>,

    /// Whether the creator closes the process and thread handles before
    /// they can be resolved.
    #[knus(property, default)]
    pub close_handles: bool,
}

impl ScenarioProcess {
    /// Command line of the process.
    pub fn command_line(&self) -> &str {
        self.command_line.as_deref().unwrap_or(&self.image_path)
    }
}

#[cfg(test)]
mod tests {

    use super::{ScenarioConfig, ScenarioProcess};

    #[test]
    fn parse_from_kdl_no_processes() {
        let config = knus::parse::<ScenarioConfig>("<content>", "")
            .map_err(miette::Report::new)
            .expect("parse kdl");

        assert_eq!(
            config,
            ScenarioConfig {
                log_skipped: true,
                processes: vec![],
            }
        );

        let config = knus::parse::<ScenarioConfig>(
            "<content>",
            indoc::indoc! {r#"
                log-skipped false
            "#},
        )
        .map_err(miette::Report::new)
        .expect("parse kdl");

        assert_eq!(
            config,
            ScenarioConfig {
                log_skipped: false,
                processes: vec![],
            }
        );
    }

    #[test]
    fn parse_from_kdl_with_processes() {
        let config = knus::parse::<ScenarioConfig>(
            "<content>",
            indoc::indoc! {r#"
                process "C:\\Windows\\System32\\cmd.exe" command-line="cmd.exe /c echo hi"
                process "C:\\Windows\\notepad.exe" close-handles=true
            "#},
        )
        .map_err(miette::Report::new)
        .expect("parse kdl");

        assert_eq!(
            config,
            ScenarioConfig {
                log_skipped: true,
                processes: vec![
                    ScenarioProcess {
                        image_path: "C:\\Windows\\System32\\cmd.exe".to_owned(),
                        command_line: Some("cmd.exe /c echo hi".to_owned()),
                        close_handles: false,
                    },
                    ScenarioProcess {
                        image_path: "C:\\Windows\\notepad.exe".to_owned(),
                        command_line: None,
                        close_handles: true,
                    },
                ]
            }
        );

        assert_eq!(config.processes[0].command_line(), "cmd.exe /c echo hi");
        assert_eq!(config.processes[1].command_line(), "C:\\Windows\\notepad.exe");
    }

    #[test]
    fn parse_from_kdl_missing_image_path() {
        assert!(knus::parse::<ScenarioConfig>("<content>", "process command-line=\"a\"").is_err());
    }
}
