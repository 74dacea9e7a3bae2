#![allow(dead_code)]

use std::sync::Mutex;

use reportforge::error::ForgeResult;
use reportforge::platform::{CommandOutput, CommandRunner, HostPlatform, Invocation, ToolTable};

type Handler = Box<dyn Fn(&Invocation) -> CommandOutput + Send + Sync>;

/// Answers every invocation from a closure and remembers what was asked.
pub struct ScriptedRunner {
    handler: Handler,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new(handler: impl Fn(&Invocation) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Each call rendered as `program arg arg ...`.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|inv| {
                std::iter::once(inv.program.clone())
                    .chain(inv.args.iter().cloned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> ForgeResult<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        Ok((self.handler)(invocation))
    }
}

pub fn unix_tools() -> ToolTable {
    ToolTable::for_host(HostPlatform::Unix, "python3")
}

/// Arguments after `git -C <dir>`.
pub fn git_args(invocation: &Invocation) -> Vec<&str> {
    let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
    if args.first() == Some(&"-C") {
        args[2..].to_vec()
    } else {
        args
    }
}
