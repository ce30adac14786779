// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use super::run::RunCtx;

pub trait Prompt {
    /// Shows `question` and reads one line. `None` on end of input.
    fn ask(&mut self, question: &str) -> Result<Option<String>>;
}

pub struct ConsolePrompt {
    term: console::Term,
}

impl ConsolePrompt {
    pub fn new() -> Self {
        Self {
            term: console::Term::stderr(),
        }
    }
}

impl Prompt for ConsolePrompt {
    fn ask(&mut self, question: &str) -> Result<Option<String>> {
        self.term
            .write_str(&format!("{}", console::style(question).bold()))
            .context("failed to write prompt")?;

        let mut line = String::new();
        let len = io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read answer")?;
        match len {
            0 => Ok(None),
            _ => Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string())),
        }
    }
}

/// One evaluation against a user supplied timestamps file.
pub trait TestSession {
    fn prepare_test(&mut self, timestamps: &Path, output_dir: &Path) -> Result<()>;
    fn run_test(&mut self) -> Result<()>;
    fn save_results(&mut self) -> Result<()>;
}

impl<'a> TestSession for RunCtx<'a> {
    fn prepare_test(&mut self, timestamps: &Path, output_dir: &Path) -> Result<()> {
        self.actual_timestamps = Some(timestamps.to_owned());
        self.set_output_dir(output_dir)
    }

    fn run_test(&mut self) -> Result<()> {
        self.test_model()
    }

    fn save_results(&mut self) -> Result<()> {
        self.save_model_results().map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestState {
    AwaitInput,
    ValidateFile(String),
    RunTest { file: PathBuf, name: String },
    SaveResults,
    AwaitContinue,
    Terminate,
}

fn get_input_and_log(prompt: &mut dyn Prompt, question: &str) -> Result<Option<String>> {
    let answer = prompt.ask(question)?;
    match answer.as_ref() {
        Some(v) => info!("test: {}{}", question, v),
        None => info!("test: {}<EOF>", question),
    }
    Ok(answer)
}

fn step(
    state: TestState,
    session: &mut dyn TestSession,
    prompt: &mut dyn Prompt,
    base_dir: &Path,
) -> Result<TestState> {
    Ok(match state {
        TestState::AwaitInput => {
            match get_input_and_log(prompt, "Enter test timestamps file path: ")? {
                Some(file) => TestState::ValidateFile(file.trim().to_string()),
                None => TestState::Terminate,
            }
        }
        TestState::ValidateFile(file) => {
            if file.len() == 0 || !Path::new(&file).exists() {
                error!("test: timestamps file {:?} doesn't exist", &file);
                return Ok(TestState::AwaitInput);
            }
            match get_input_and_log(prompt, "Enter test time series name: ")? {
                None => TestState::Terminate,
                Some(name) if name.trim().len() == 0 => {
                    warn!("test: empty test name");
                    TestState::AwaitInput
                }
                Some(name) => TestState::RunTest {
                    file: PathBuf::from(file),
                    name: name.trim().to_string(),
                },
            }
        }
        TestState::RunTest { file, name } => {
            session.prepare_test(&file, &base_dir.join(&name))?;
            session.run_test()?;
            TestState::SaveResults
        }
        TestState::SaveResults => {
            session.save_results()?;
            TestState::AwaitContinue
        }
        TestState::AwaitContinue => {
            match get_input_and_log(prompt, "Do you want to run more tests? (y/n): ")? {
                Some(v) if v.trim().eq_ignore_ascii_case("y") => TestState::AwaitInput,
                _ => TestState::Terminate,
            }
        }
        TestState::Terminate => TestState::Terminate,
    })
}

/// Prompts for test timestamps files until the user stops. Each test writes
/// into `base_dir/<name>`.
pub fn run_interactive(
    session: &mut dyn TestSession,
    prompt: &mut dyn Prompt,
    base_dir: &Path,
) -> Result<()> {
    info!("test: entering interactive testing mode");
    let mut state = TestState::AwaitInput;
    while state != TestState::Terminate {
        state = step(state, session, prompt, base_dir)?;
    }
    info!("test: leaving interactive testing mode");
    Ok(())
}

pub fn run_tests_with_mode(rctx: &mut RunCtx) -> Result<()> {
    if rctx.args.interactive {
        let base_dir = rctx.output_dir.clone();
        run_interactive(rctx, &mut ConsolePrompt::new(), &base_dir)
    } else {
        rctx.run_test()?;
        rctx.save_results()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::VecDeque;
    use std::fs;

    struct Scripted {
        answers: VecDeque<String>,
        asked: Vec<String>,
    }

    impl Scripted {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: answers.iter().map(|x| x.to_string()).collect(),
                asked: vec![],
            }
        }
    }

    impl Prompt for Scripted {
        fn ask(&mut self, question: &str) -> Result<Option<String>> {
            self.asked.push(question.to_string());
            Ok(self.answers.pop_front())
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_run: bool,
    }

    impl TestSession for Recorder {
        fn prepare_test(&mut self, timestamps: &Path, output_dir: &Path) -> Result<()> {
            self.calls.push(format!(
                "prepare {} {}",
                timestamps.file_name().unwrap().to_str().unwrap(),
                output_dir.file_name().unwrap().to_str().unwrap()
            ));
            Ok(())
        }
        fn run_test(&mut self) -> Result<()> {
            if self.fail_run {
                bail!("telemetry store unreachable");
            }
            self.calls.push("run".into());
            Ok(())
        }
        fn save_results(&mut self) -> Result<()> {
            self.calls.push("save".into());
            Ok(())
        }
    }

    fn test_file(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, "").unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_missing_file_reprompts() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let good = test_file(dir.path(), "t1.log");

        let mut prompt = Scripted::new(&["/nonexistent/t0.log", &good, "first", "n"]);
        let mut rec = Recorder::default();
        run_interactive(&mut rec, &mut prompt, dir.path()).unwrap();

        assert_eq!(rec.calls, vec!["prepare t1.log first", "run", "save"]);
        assert_eq!(prompt.asked.len(), 4);
        assert_eq!(prompt.asked[0], prompt.asked[1]);
    }

    #[test]
    fn test_yes_loops_and_eof_terminates() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let a = test_file(dir.path(), "a.log");
        let b = test_file(dir.path(), "b.log");

        let mut prompt = Scripted::new(&[&a, "one", "Y", &b, "two", "y"]);
        let mut rec = Recorder::default();
        run_interactive(&mut rec, &mut prompt, dir.path()).unwrap();
        assert_eq!(
            rec.calls,
            vec![
                "prepare a.log one",
                "run",
                "save",
                "prepare b.log two",
                "run",
                "save"
            ]
        );
        // the third file prompt hit EOF
        assert_eq!(prompt.asked.len(), 7);
    }

    #[test]
    fn test_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let f = test_file(dir.path(), "x.log");
        let mut rec = Recorder::default();

        let mut prompt = Scripted::new(&["  "]);
        let state = step(
            TestState::ValidateFile(f.clone()),
            &mut rec,
            &mut prompt,
            dir.path(),
        )
        .unwrap();
        assert_eq!(state, TestState::AwaitInput);

        let mut prompt = Scripted::new(&["maybe"]);
        let state = step(TestState::AwaitContinue, &mut rec, &mut prompt, dir.path()).unwrap();
        assert_eq!(state, TestState::Terminate);

        let mut prompt = Scripted::new(&[]);
        let state = step(
            TestState::RunTest {
                file: PathBuf::from(&f),
                name: "n".into(),
            },
            &mut rec,
            &mut prompt,
            dir.path(),
        )
        .unwrap();
        assert_eq!(state, TestState::SaveResults);
        assert_eq!(rec.calls, vec!["prepare x.log n", "run"]);
    }

    #[test]
    fn test_run_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let f = test_file(dir.path(), "x.log");
        let mut prompt = Scripted::new(&[&f, "t", "y"]);
        let mut rec = Recorder {
            fail_run: true,
            ..Default::default()
        };
        assert!(run_interactive(&mut rec, &mut prompt, dir.path()).is_err());
        assert_eq!(rec.calls, vec!["prepare x.log t"]);
    }
}
