//! Scripted backend and probe for executor tests.

use super::{BackendError, BackendKind, DispatchContext, DispatchOutput, ExecutionBackend, HealthProbe};
use crate::plan::Subtask;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Ok,
    Fail(String),
    RateLimited,
}

/// Backend that replays scripted responses per subtask and records how it
/// was called.
pub struct MockBackend {
    name: String,
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<(String, BackendKind)>>,
    timeline: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::from_millis(10),
            scripts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            timeline: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue responses for a subtask. Unscripted calls succeed.
    pub fn script(self, subtask_id: &str, responses: Vec<MockResponse>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(subtask_id.to_string(), responses.into());
        self
    }

    /// Highest number of concurrent `execute` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Subtask ids in the order dispatch started.
    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    /// `"start <id>"` and `"end <id>"` entries in the order they happened.
    pub fn timeline(&self) -> Vec<String> {
        self.timeline.lock().unwrap().clone()
    }

    /// Position of an entry in the timeline.
    pub fn timeline_index(&self, entry: &str) -> Option<usize> {
        self.timeline.lock().unwrap().iter().position(|e| e == entry)
    }

    pub fn calls_for(&self, subtask_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == subtask_id)
            .count()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        subtask: &Subtask,
        ctx: &DispatchContext,
    ) -> Result<DispatchOutput, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push((subtask.id.clone(), ctx.backend));
        self.timeline.lock().unwrap().push(format!("start {}", subtask.id));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        let response = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&subtask.id)
            .and_then(|q| q.pop_front())
            .unwrap_or(MockResponse::Ok);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.timeline.lock().unwrap().push(format!("end {}", subtask.id));

        match response {
            MockResponse::Ok => Ok(DispatchOutput {
                output: format!("{} done by {}", subtask.id, self.name),
                output_refs: vec![format!("out/{}.txt", subtask.id)],
            }),
            MockResponse::Fail(message) => Err(BackendError::new(message)),
            MockResponse::RateLimited => Err(BackendError::new("429 Too Many Requests").with_status(429)),
        }
    }
}

/// Probe whose answers are scripted, then fixed.
pub struct MockProbe {
    answers: Mutex<VecDeque<bool>>,
    fallback_answer: AtomicBool,
    calls: AtomicUsize,
}

impl MockProbe {
    pub fn always(available: bool) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback_answer: AtomicBool::new(available),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer from `answers` in order, then `then` forever.
    pub fn sequence(answers: Vec<bool>, then: bool) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            fallback_answer: AtomicBool::new(then),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.fallback_answer.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn is_available(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback_answer.load(Ordering::SeqCst))
    }
}
