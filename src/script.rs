// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Registry backing the slave side's RUNSCRIPT command. Concrete test
//! scripts (query-latency, insert-throughput, publish-and-modify, ...) are
//! out of scope for this crate; callers register their own factories here,
//! keyed by the name a RUNSCRIPT body names. The one built-in entry
//! (`"noop"`) exists only so the end-to-end net tests have a script to run
//! without depending on an external crate.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::HarnessResult;
use crate::numbered_command::Body;

/// One run of a named test script. `run` is called synchronously on
/// whatever thread the RUNSCRIPT handler dispatches it to (typically a
/// [`crate::worker_pool::WorkerPool`] worker); it should return once the
/// script's work is complete.
pub trait Script: Send {
    fn run(&mut self, args: Body) -> HarnessResult<()>;
}

pub type ScriptFactory = Box<dyn Fn() -> Box<dyn Script> + Send + Sync>;

/// Maps script names to factories. Registration is expected to happen
/// during setup, before any RUNSCRIPT traffic arrives.
pub struct ScriptManager {
    scripts: Mutex<HashMap<String, ScriptFactory>>,
}

impl ScriptManager {
    pub fn new() -> Self {
        let mut scripts: HashMap<String, ScriptFactory> = HashMap::new();
        scripts.insert("noop".into(), Box::new(|| Box::new(NoopScript) as Box<dyn Script>));
        ScriptManager {
            scripts: Mutex::new(scripts),
        }
    }

    pub fn register(&self, name: impl Into<String>, factory: ScriptFactory) {
        self.scripts.lock().unwrap().insert(name.into(), factory);
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Script>> {
        self.scripts.lock().unwrap().get(name).map(|factory| factory())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.scripts.lock().unwrap().contains_key(name)
    }
}

impl Default for ScriptManager {
    fn default() -> Self {
        ScriptManager::new()
    }
}

struct NoopScript;

impl Script for NoopScript {
    fn run(&mut self, _args: Body) -> HarnessResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_script_is_registered_by_default() {
        let manager = ScriptManager::new();
        assert!(manager.is_registered("noop"));
        let mut script = manager.create("noop").unwrap();
        script.run(Body::default()).unwrap();
    }

    #[test]
    fn unregistered_script_returns_none() {
        let manager = ScriptManager::new();
        assert!(manager.create("bogus").is_none());
    }

    #[test]
    fn custom_script_can_be_registered() {
        let manager = ScriptManager::new();
        manager.register("custom", Box::new(|| Box::new(NoopScript) as Box<dyn Script>));
        assert!(manager.is_registered("custom"));
    }
}
