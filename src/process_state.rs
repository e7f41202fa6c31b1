//! Command lifecycle derived from the shell's output stream.
//!
//! The interactive shell gives no structured signal when a command ends, so
//! the state is inferred from markers in its output. All of that matching
//! lives here, driven by an [`OutputPatterns`] table.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    #[default]
    Idle,
    Running,
    Aborting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputPatterns {
    /// Echoes of the interrupt byte. A PTY usually echoes `^C`, a raw pipe the byte itself.
    pub interrupt_echo: Vec<String>,
    /// Suffix of the line the shell prints when it redraws its prompt.
    pub prompt_marker: String,
    /// Substring of the test runner's summary line.
    pub test_summary: String,
    /// Substring of a summary line that reports failures.
    pub test_failure: String,
}

impl Default for OutputPatterns {
    fn default() -> Self {
        Self {
            interrupt_echo: vec!["\u{3}".to_string(), "^C".to_string()],
            prompt_marker: "[3G".to_string(),
            test_summary: "Tests".to_string(),
            test_failure: "failed".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    StateChanged { from: ProcessState, to: ProcessState },
    TestFinished(TestOutcome),
}

#[derive(Clone, Debug, Default)]
pub struct ProcessStateMachine {
    state: ProcessState,
    patterns: OutputPatterns,
    last_outcome: Option<TestOutcome>,
}

impl ProcessStateMachine {
    pub fn new(patterns: OutputPatterns) -> Self {
        Self {
            state: ProcessState::Idle,
            patterns,
            last_outcome: None,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn last_outcome(&self) -> Option<TestOutcome> {
        self.last_outcome
    }

    /// A command was written to the shell.
    pub fn on_run(&mut self) -> Option<ProcessEvent> {
        match self.state {
            ProcessState::Idle => self.transition(ProcessState::Running),
            ProcessState::Running | ProcessState::Aborting => None,
        }
    }

    /// The interrupt byte was written. Moves to `Aborting` optimistically; only
    /// the prompt marker brings the machine back to `Idle`.
    pub fn on_abort(&mut self) -> Option<ProcessEvent> {
        self.last_outcome = None;
        match self.state {
            ProcessState::Running => self.transition(ProcessState::Aborting),
            ProcessState::Idle | ProcessState::Aborting => None,
        }
    }

    /// Feeds one chunk of shell output. Lines are matched in stream order.
    pub fn on_output(&mut self, chunk: &str) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        for line in chunk.split_inclusive('\n') {
            self.on_line(line, &mut events);
        }
        events
    }

    fn on_line(&mut self, line: &str, events: &mut Vec<ProcessEvent>) {
        let interrupted = self
            .patterns
            .interrupt_echo
            .iter()
            .any(|echo| !echo.is_empty() && line.contains(echo.as_str()));
        if interrupted && self.state == ProcessState::Running {
            events.extend(self.transition(ProcessState::Aborting));
        }

        if !self.patterns.test_summary.is_empty() && line.contains(&self.patterns.test_summary) {
            let outcome = if line.contains(&self.patterns.test_failure) {
                TestOutcome::Failed
            } else {
                TestOutcome::Passed
            };
            self.last_outcome = Some(outcome);
            events.push(ProcessEvent::TestFinished(outcome));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if !self.patterns.prompt_marker.is_empty()
            && trimmed.ends_with(&self.patterns.prompt_marker)
            && self.state != ProcessState::Idle
        {
            events.extend(self.transition(ProcessState::Idle));
        }
    }

    fn transition(&mut self, to: ProcessState) -> Option<ProcessEvent> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(ProcessEvent::StateChanged { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ProcessStateMachine {
        ProcessStateMachine::new(OutputPatterns::default())
    }

    #[test]
    fn prompt_marker_returns_to_idle() {
        let mut machine = machine();
        assert_eq!(
            machine.on_run(),
            Some(ProcessEvent::StateChanged {
                from: ProcessState::Idle,
                to: ProcessState::Running
            })
        );
        machine.on_output("running tests\n");
        assert_eq!(machine.state(), ProcessState::Running);
        machine.on_output("...\u{1b}[3G");
        assert_eq!(machine.state(), ProcessState::Idle);
    }

    #[test]
    fn interrupt_echo_moves_to_aborting() {
        let mut machine = machine();
        machine.on_run();
        let events = machine.on_output("partial output \u{3}");
        assert_eq!(machine.state(), ProcessState::Aborting);
        assert_eq!(
            events,
            vec![ProcessEvent::StateChanged {
                from: ProcessState::Running,
                to: ProcessState::Aborting
            }]
        );
        machine.on_output("^C\r\n");
        assert_eq!(machine.state(), ProcessState::Aborting);
        machine.on_output("~/project\u{1b}[3G");
        assert_eq!(machine.state(), ProcessState::Idle);
    }

    #[test]
    fn interrupt_and_prompt_in_one_chunk_pass_through_aborting() {
        let mut machine = machine();
        machine.on_run();
        let events = machine.on_output("^C\n\u{1b}[3G");
        assert_eq!(events.len(), 2);
        assert_eq!(machine.state(), ProcessState::Idle);
    }

    #[test]
    fn abort_without_echo_stays_aborting() {
        let mut machine = machine();
        machine.on_run();
        machine.on_abort();
        machine.on_output("still printing\n");
        machine.on_output("more\n");
        assert_eq!(machine.state(), ProcessState::Aborting);
    }

    #[test]
    fn abort_when_idle_changes_nothing() {
        let mut machine = machine();
        assert_eq!(machine.on_abort(), None);
        assert_eq!(machine.state(), ProcessState::Idle);
    }

    #[test]
    fn prompt_while_idle_emits_nothing() {
        let mut machine = machine();
        assert!(machine.on_output("$ \u{1b}[3G").is_empty());
    }

    #[test]
    fn test_summary_is_classified() {
        let mut machine = machine();
        machine.on_run();
        let events = machine.on_output("Tests:       1 failed, 3 passed, 4 total\n");
        assert_eq!(events, vec![ProcessEvent::TestFinished(TestOutcome::Failed)]);
        assert_eq!(machine.state(), ProcessState::Running);

        machine.on_output("Tests:       4 passed, 4 total\n");
        assert_eq!(machine.last_outcome(), Some(TestOutcome::Passed));

        machine.on_abort();
        assert_eq!(machine.last_outcome(), None);
    }

    #[test]
    fn custom_patterns_replace_defaults() {
        let mut machine = ProcessStateMachine::new(OutputPatterns {
            interrupt_echo: vec!["<INT>".into()],
            prompt_marker: "$ ".into(),
            test_summary: "RESULT".into(),
            test_failure: "FAIL".into(),
        });
        machine.on_run();
        machine.on_output("<INT>\n");
        assert_eq!(machine.state(), ProcessState::Aborting);
        machine.on_output("user@box $ ");
        assert_eq!(machine.state(), ProcessState::Idle);
    }
}
