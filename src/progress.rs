//! Console reporting of build actions.  Workers on several threads print
//! through one instance, so output is serialized per message.

use crate::task::TaskResult;
use std::io::Write;
use std::sync::Mutex;

pub struct ConsoleProgress {
    /// Also print a line when an action finishes cleanly.
    verbose: bool,
    console: Mutex<()>,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress {
            verbose,
            console: Mutex::new(()),
        }
    }

    pub fn task_started(&self, msg: &str) {
        let _guard = self.console.lock().unwrap();
        println!("{}", msg);
    }

    pub fn task_finished(&self, msg: &str, result: &TaskResult) {
        let _guard = self.console.lock().unwrap();
        if !result.success {
            println!("failed: {}", msg);
        }
        if !result.output.is_empty() {
            // Tool output (compiler warnings, errors) passes through as-is.
            std::io::stdout().write_all(&result.output).unwrap();
            if !result.output.ends_with(b"\n") {
                println!();
            }
        } else if self.verbose && result.success {
            println!("done: {}", msg);
        }
    }

    pub fn log(&self, msg: &str) {
        let _guard = self.console.lock().unwrap();
        println!("{}", msg);
    }
}
