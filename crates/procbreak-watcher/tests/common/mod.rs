use procbreak_emulator::{KernelScenario, Session, StoppedThread};
use procbreak_watcher::debugger::{BreakpointId, DebugBackend, DebugEvent};
use procbreak_watcher::filter::{WatchFilter, WatchOptions};
use procbreak_watcher::watcher::{WatchId, WatchTask};

pub const CMD_PATH: &str = "C:\\Windows\\System32\\cmd.exe";

pub const NOTEPAD_PATH: &str = "C:\\Windows\\System32\\notepad.exe";

/// Arms a single watch over the session built by `scenario`.
pub fn arm(scenario: KernelScenario, filter: WatchFilter) -> (WatchTask<Session>, WatchId) {
    let mut task = WatchTask::new(scenario.into_session());
    let id = task.arm(filter, WatchOptions::default()).unwrap();

    (task, id)
}

/// Waits for the next breakpoint hit, without going through a watch task.
pub async fn next_hit(session: &mut Session) -> (BreakpointId, StoppedThread) {
    match session.wait_event().await.unwrap() {
        DebugEvent::Breakpoint { id, thread } => (id, thread),
        DebugEvent::SessionEnded => panic!("session has ended"),
    }
}

/// Lines written to the debugger's output that match `prefix`.
pub fn lines_with<'a>(session: &'a Session, prefix: &'a str) -> Vec<&'a str> {
    session
        .output()
        .iter()
        .map(String::as_str)
        .filter(|line| line.starts_with(prefix))
        .collect()
}
