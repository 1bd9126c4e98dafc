use std::collections::{HashMap, VecDeque};
use std::future::Future;

use parking_lot::Mutex;

use super::{QueryClient, QueryError};

/// What a scripted `(address, oid)` pair answers next.
#[derive(Debug)]
enum Script {
    /// Replies consumed in order; `None` is a failed query.
    Queue(VecDeque<Option<i128>>),
    /// A counter advancing by `step` on every successful read.
    Ramp { next: i128, step: i128 },
}

/// In-memory query client answering from per-value scripts.
///
/// Unscripted or exhausted pairs fail with `QueryError::NoValue`.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<(String, String), Script>>,
    calls: Mutex<HashMap<(String, String), usize>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn push(&self, address: &str, oid: &str, value: i128) {
        self.enqueue(address, oid, Some(value));
    }

    /// Queue a failed reply.
    pub fn push_failure(&self, address: &str, oid: &str) {
        self.enqueue(address, oid, None);
    }

    /// Answer every read with a counter starting at `start`, advancing by `step`.
    pub fn ramp(&self, address: &str, oid: &str, start: i128, step: i128) {
        self.scripts.lock().insert(
            (address.to_string(), oid.to_string()),
            Script::Ramp { next: start, step },
        );
    }

    /// Number of queries issued for the pair so far.
    pub fn calls(&self, address: &str, oid: &str) -> usize {
        self.calls
            .lock()
            .get(&(address.to_string(), oid.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn enqueue(&self, address: &str, oid: &str, reply: Option<i128>) {
        let mut scripts = self.scripts.lock();
        let script = scripts
            .entry((address.to_string(), oid.to_string()))
            .or_insert_with(|| Script::Queue(VecDeque::new()));
        match script {
            Script::Queue(queue) => queue.push_back(reply),
            Script::Ramp { .. } => *script = Script::Queue(VecDeque::from([reply])),
        }
    }

    fn answer(&self, address: &str, oid: &str) -> Result<i128, QueryError> {
        let key = (address.to_string(), oid.to_string());
        *self.calls.lock().entry(key.clone()).or_insert(0) += 1;

        let mut scripts = self.scripts.lock();
        let reply = match scripts.get_mut(&key) {
            Some(Script::Queue(queue)) => queue.pop_front().ok_or(QueryError::NoValue)?,
            Some(Script::Ramp { next, step }) => {
                let value = *next;
                *next += *step;
                Some(value)
            }
            None => return Err(QueryError::NoValue),
        };

        reply.ok_or_else(|| QueryError::Request {
            address: address.to_string(),
            reason: "scripted failure".to_string(),
        })
    }
}

impl QueryClient for ScriptedClient {
    fn get(
        &self,
        address: &str,
        _community: &str,
        oid: &str,
    ) -> impl Future<Output = Result<i128, QueryError>> + Send {
        let reply = self.answer(address, oid);
        async move { reply }
    }
}
