use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;

use miette::IntoDiagnostic;
use procbreak_emulator::{KernelScenario, ProcessCreation, Session};
use procbreak_watcher::debugger::Thread;
use procbreak_watcher::filter::{WatchFilter, WatchOptions};
use procbreak_watcher::watcher::{WatchStop, WatchTask};

use crate::ScenarioConfig;

/// Runs the subcommand for breaking on new processes.
///
/// Every line written by the watcher, and every stop on an initial thread,
/// is written to `out`.
///
/// Returns the number of initial threads reached.
pub fn evaluate_watch<W: Write>(
    scenario: String,
    quiet: bool,
    max_stops: Option<usize>,
    process_name: String,
    process_command: Option<String>,
    mut out: W,
) -> miette::Result<usize> {
    let config = parse_scenario_config(scenario)?;

    let options = WatchOptions {
        log_skipped: config.log_skipped && !quiet,
    };

    let filter = match process_command {
        Some(command) => WatchFilter::new(process_name).with_command(command),
        None => WatchFilter::new(process_name),
    };

    let session = build_session(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(async move {
        let mut task = WatchTask::new(session);
        let watch = task.arm(filter, options).into_diagnostic()?;

        flush_output(&mut task, &mut out)?;

        let mut stops = 0;

        while max_stops.is_none_or(|max| stops < max) {
            let stop = task.wait_stop().await.into_diagnostic()?;

            flush_output(&mut task, &mut out)?;

            let WatchStop::InitialThread { thread, result, .. } = stop else {
                break;
            };

            writeln!(
                out,
                "[!] Initial thread {:#x} of process {:#x} reached {:#x}",
                thread.id(),
                result.process_object_addr,
                thread.instr_addr(),
            )
            .into_diagnostic()?;

            stops += 1;

            task.resume(thread).into_diagnostic()?;
        }

        task.disarm(watch).into_diagnostic()?;

        Ok(stops)
    })
}

fn flush_output<W: Write>(task: &mut WatchTask<Session>, out: &mut W) -> miette::Result<()> {
    for line in task.session_mut().take_output() {
        writeln!(out, "{line}").into_diagnostic()?;
    }

    Ok(())
}

fn build_session(config: &ScenarioConfig) -> miette::Result<Session> {
    let mut scenario = KernelScenario::new();

    for process in &config.processes {
        let creation = ProcessCreation::new(&process.image_path, process.command_line());

        let creation = if process.close_handles {
            creation.close_handles_early()
        } else {
            creation
        };

        scenario
            .create_user_process_with(creation)
            .into_diagnostic()?;
    }

    Ok(scenario.into_session())
}

fn parse_scenario_config(scenario: String) -> miette::Result<ScenarioConfig> {
    let path = Path::new(&scenario);

    let config = if let Some((filename, "kdl")) = path
        .file_name()
        .and_then(OsStr::to_str)
        .zip(path.extension().and_then(OsStr::to_str))
    {
        let content = std::fs::read_to_string(path).into_diagnostic()?;
        knus::parse(filename, &content)?
    } else {
        knus::parse("<content>", &scenario)?
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::evaluate_watch;

    const SCENARIO: &str = indoc::indoc! {r#"
        process "C:\\Windows\\System32\\svchost.exe" command-line="svchost.exe -k netsvcs"
        process "C:\\Windows\\System32\\cmd.exe" command-line="cmd.exe /c echo hi"
        process "C:\\Windows\\System32\\CMD.EXE" command-line="CMD.EXE /k dir"
    "#};

    fn run(
        scenario: &str,
        quiet: bool,
        max_stops: Option<usize>,
        process_command: Option<&str>,
    ) -> (usize, Vec<String>) {
        let mut out = Vec::new();

        let stops = evaluate_watch(
            scenario.to_owned(),
            quiet,
            max_stops,
            "cmd.exe".to_owned(),
            process_command.map(str::to_owned),
            &mut out,
        )
        .unwrap();

        let lines = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect();

        (stops, lines)
    }

    #[test]
    fn watch_inline_scenario() {
        let (stops, lines) = run(SCENARIO, false, None, None);

        assert_eq!(stops, 2);
        assert_eq!(lines[0], "[+] Breaking in new 'cmd.exe' processes");
        assert_eq!(lines[1], "[+] New process: svchost.exe");
        assert_eq!(lines[2], "[!] New process: cmd.exe");
        assert!(lines[3].starts_with("[!] New process / thread: "));
        assert!(lines[4].starts_with("[!] Initial thread "));
        assert_eq!(lines[5], "[!] New process: CMD.EXE");
        assert_eq!(lines.len(), 8);
    }

    #[test]
    fn watch_quiet() {
        let (stops, lines) = run(SCENARIO, true, None, None);

        assert_eq!(stops, 2);
        assert!(!lines.iter().any(|line| line.starts_with("[+] New process")));
    }

    #[test]
    fn watch_with_command() {
        let (stops, lines) = run(SCENARIO, false, None, Some("ECHO HI"));

        assert_eq!(stops, 1);
        assert!(!lines.contains(&"[!] New process: CMD.EXE".to_owned()));
    }

    #[test]
    fn watch_max_stops() {
        let (stops, _) = run(SCENARIO, false, Some(1), None);
        assert_eq!(stops, 1);

        let (stops, lines) = run(SCENARIO, false, Some(0), None);
        assert_eq!(stops, 0);
        assert_eq!(lines, ["[+] Breaking in new 'cmd.exe' processes"]);
    }

    #[test]
    fn watch_closed_handles() {
        let (stops, lines) = run(
            r#"process "C:\\Windows\\System32\\cmd.exe" close-handles=true"#,
            false,
            None,
            None,
        );

        assert_eq!(stops, 0);
        assert!(lines[2].starts_with("[-] Dropped process creation event: "));
    }

    #[test]
    fn watch_scenario_file() {
        let mut file = tempfile::Builder::new().suffix(".kdl").tempfile().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();

        let path = file.path().to_str().unwrap();

        let (stops, _) = run(path, false, None, None);
        assert_eq!(stops, 2);
    }

    #[test]
    fn watch_invalid_scenario() {
        let res = evaluate_watch(
            "process".to_owned(),
            false,
            None,
            "cmd.exe".to_owned(),
            None,
            Vec::new(),
        );

        assert!(res.is_err());
    }
}
