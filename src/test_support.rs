//! Step-recording assertions for tests.
//!
//! `test_report!` creates a [`TestReport`] named after the calling test. Every
//! assertion is recorded as a step and also enforced with the std assert
//! macros. When `TEST_REPORT_DIR` is set, the steps are written there as one
//! JSON document per test when the report is dropped.

use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::sync::Mutex;

/// Create a `TestReport` for the enclosing test function.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3];
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::test_support::TestReport::new(name, $title, file!(), line!())
    }};
}

#[derive(serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Step {
    Action { message: String },
    Output { label: String, text: String },
    Assert { message: String, passed: bool },
}

pub struct TestReport {
    test: String,
    title: String,
    source: String,
    steps: Mutex<Vec<Step>>,
    report_dir: Option<PathBuf>,
}

#[allow(dead_code)]
impl TestReport {
    pub fn new(test: &str, title: &str, source_file: &str, source_line: u32) -> Self {
        Self {
            test: test.to_string(),
            title: title.to_string(),
            source: format!("{}:{}", source_file, source_line),
            steps: Mutex::new(Vec::new()),
            report_dir: std::env::var("TEST_REPORT_DIR").ok().map(PathBuf::from),
        }
    }

    fn push(&self, step: Step) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(step);
        }
    }

    pub fn action(&self, msg: impl Display) {
        self.push(Step::Action {
            message: msg.to_string(),
        });
    }

    pub fn output(&self, label: &str, text: &str) {
        self.push(Step::Output {
            label: label.to_string(),
            text: text.to_string(),
        });
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let passed = actual == expected;
        self.push(Step::Assert {
            message: format!("{}: {:?} == {:?}", label, actual, expected),
            passed,
        });
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let passed = haystack.contains(needle);
        self.push(Step::Assert {
            message: format!("{}: {:?} contains {:?}", label, haystack, needle),
            passed,
        });
        assert!(
            passed,
            "{}: {:?} does not contain {:?}",
            label, haystack, needle
        );
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.push(Step::Assert {
            message: label.to_string(),
            passed: value,
        });
        assert!(value, "{}", label);
    }

    fn write_report(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };

        let result = if std::thread::panicking() {
            "fail"
        } else {
            "pass"
        };
        let steps = match self.steps.lock() {
            Ok(steps) => steps,
            Err(_) => return,
        };
        let doc = serde_json::json!({
            "test": self.test,
            "title": self.title,
            "source": self.source,
            "result": result,
            "steps": &*steps,
        });

        let path = dir.join(format!("{}.json", self.test.replace("::", "__")));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(path, doc.to_string());
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write_report();
    }
}
