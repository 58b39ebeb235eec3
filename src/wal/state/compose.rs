//! Dispatches a replayed record to the right sub-state by a `"__state__"` tag
//! embedded in the payload. See `SPEC_FULL.md` §4.5.

use std::sync::Arc;

use serde_json::Value;

use crate::wal::error::{Error, Result};
use crate::wal::state::StateMachine;

pub const STATE_TAG: &str = "__state__";

/// A sub-state composed into a [`ComposedStateMachine`]. Implementors signal
/// "this record is not mine" by returning [`Error::SkipApply`].
pub trait SubState: Send + Sync {
    fn state_name(&self) -> &str;
    fn apply(&self, value: Value) -> Result<Value>;
}

#[derive(Default)]
pub struct ComposedStateMachine {
    subs: Vec<Arc<dyn SubState>>,
}

impl ComposedStateMachine {
    pub fn new() -> Self {
        Self { subs: Vec::new() }
    }

    pub fn register(&mut self, sub: Arc<dyn SubState>) {
        self.subs.push(sub);
    }
}

impl StateMachine for ComposedStateMachine {
    type Event = Value;
    type Response = Value;

    fn apply(&self, value: Value) -> Result<Value> {
        // Fast path: peek the state tag and route directly.
        if let Some(name) = value.get(STATE_TAG).and_then(|v| v.as_str()) {
            if let Some(sub) = self.subs.iter().find(|s| s.state_name() == name) {
                return sub.apply(value);
            }
        }
        // Slow path: try each sub-state in registration order.
        for sub in &self.subs {
            match sub.apply(value.clone()) {
                Err(Error::SkipApply) => continue,
                other => return other,
            }
        }
        Err(Error::FsmNotFound)
    }
}
