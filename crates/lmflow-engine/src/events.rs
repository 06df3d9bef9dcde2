//! The event bus: single-threaded synchronous emission.
//!
//! `plan-ready` fires once per top-level request, `step-complete` once per
//! derivation resolved. The LLM streaming events are an optional side
//! channel filled in by collaborators that support it; the engine's public
//! result never streams.

use std::sync::Arc;

use lmflow_core::{DerivationId, ExecutionTree};

use crate::plan::ExecutionPlan;

/// Events observable during a computation.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PlanReady {
        plan: Arc<ExecutionPlan>,
    },
    StepComplete {
        derivation_id: DerivationId,
        execution_tree: ExecutionTree,
        tokens_output: Option<u64>,
    },
    LlmThinkingUpdate {
        text: String,
    },
    LlmTokenUpdate {
        delta: String,
    },
    LlmCallEnd {
        tokens_output: Option<u64>,
    },
}

/// A synchronous observer. Closures work directly.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event)
    }
}

/// Fan-out to engine-level subscribers, in subscription order.
#[derive(Default)]
pub struct EventBus {
    observers: Vec<Arc<dyn EventObserver>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Arc<dyn EventObserver>) {
        self.observers.push(observer);
    }

    pub fn emit(&self, event: &EngineEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn bus_fans_out_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for tag in ["first", "second"] {
            let log = Arc::clone(&log);
            bus.subscribe(Arc::new(move |event: &EngineEvent| {
                if let EngineEvent::LlmTokenUpdate { delta } = event {
                    log.lock().unwrap().push(format!("{}:{}", tag, delta));
                }
            }));
        }
        bus.emit(&EngineEvent::LlmTokenUpdate {
            delta: "x".to_string(),
        });
        assert_eq!(
            log.lock().unwrap().clone(),
            vec!["first:x".to_string(), "second:x".to_string()]
        );
    }
}
