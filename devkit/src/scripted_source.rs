/*!
Scripted metric source for driving the collector without a network.

Each fetch consumes the next scripted step; once the script runs out the
last step repeats. Every call is recorded so tests can assert on retry
counts.
*/

use futures::future::BoxFuture;
use opscentre_kernel::sources::{MetricSource, SourceError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Step {
    Respond(Value),
    Fail(String),
    /// respond after a delay (for timeout and deadline tests)
    Delay(Duration, Value),
    /// never answer
    Hang,
}

pub struct ScriptedSource {
    name: String,
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, step: Step) -> &Self {
        self.script.lock().push_back(step);
        self
    }

    pub fn respond(&self, payload: Value) -> &Self {
        self.push(Step::Respond(payload))
    }

    pub fn fail(&self, reason: &str) -> &Self {
        self.push(Step::Fail(reason.to_string()))
    }

    /// Drop the remaining script and answer `step` from now on.
    pub fn always(&self, step: Step) {
        let mut last = self.last.lock();
        self.script.lock().clear();
        *last = Some(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut last = self.last.lock();
        if let Some(step) = self.script.lock().pop_front() {
            *last = Some(step.clone());
            return step;
        }
        last.clone().unwrap_or_else(|| Step::Fail("script empty".into()))
    }
}

impl MetricSource for ScriptedSource {
    fn fetch(&self) -> BoxFuture<'_, Result<Value, SourceError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        Box::pin(async move {
            match step {
                Step::Respond(v) => Ok(v),
                Step::Fail(reason) => Err(SourceError::Unavailable(reason)),
                Step::Delay(d, v) => {
                    tokio::time::sleep(d).await;
                    Ok(v)
                }
                Step::Hang => futures::future::pending().await,
            }
        })
    }

    fn describe(&self) -> String {
        format!("scripted {}", self.name)
    }
}
