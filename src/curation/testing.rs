//! Scripted in-process model for engine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{Message, OutputSchema, VisionModel};

#[derive(Debug, Clone, Copy)]
pub(crate) enum FailMode {
    Never,
    Always,
    /// The first `n` calls of any kind fail.
    First(usize),
    /// Text calls succeed, structured calls always fail.
    StructuredAlways,
    /// Text calls always fail, structured calls succeed.
    TextAlways,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct ScriptedModel {
    fail: FailMode,
    jitter_ms: u64,
    seq: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    text_log: Mutex<Vec<Vec<Message>>>,
    structured_log: Mutex<Vec<Vec<Message>>>,
    queued: Mutex<VecDeque<serde_json::Value>>,
    fallback: serde_json::Value,
}

impl ScriptedModel {
    pub(crate) fn new(fail: FailMode) -> Self {
        Self {
            fail,
            jitter_ms: 0,
            seq: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            text_log: Mutex::new(Vec::new()),
            structured_log: Mutex::new(Vec::new()),
            queued: Mutex::new(VecDeque::new()),
            fallback: serde_json::json!({
                "reasoning": "scripted",
                "unit_quality_score": 0.8,
                "classification": "Good"
            }),
        }
    }

    /// Delay every call by a deterministic pseudo-random 0..=`max_ms`.
    pub(crate) fn with_jitter(mut self, max_ms: u64) -> Self {
        self.jitter_ms = max_ms;
        self
    }

    /// Queue one structured response; served before the fallback.
    pub(crate) fn with_structured(self, value: serde_json::Value) -> Self {
        self.queued.lock().push_back(value);
        self
    }

    pub(crate) fn with_fallback(mut self, value: serde_json::Value) -> Self {
        self.fallback = value;
        self
    }

    pub(crate) fn text_calls(&self) -> usize {
        self.text_log.lock().len()
    }

    pub(crate) fn structured_calls(&self) -> usize {
        self.structured_log.lock().len()
    }

    pub(crate) fn text_log(&self) -> Vec<Vec<Message>> {
        self.text_log.lock().clone()
    }

    pub(crate) fn structured_log(&self) -> Vec<Vec<Message>> {
        self.structured_log.lock().clone()
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> (usize, InFlight<'_>) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        if self.jitter_ms > 0 {
            let ms = (n as u64).wrapping_mul(7919).wrapping_add(13) % (self.jitter_ms + 1);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        } else {
            tokio::task::yield_now().await;
        }
        (n, guard)
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, messages: &[Message]) -> anyhow::Result<String> {
        self.text_log.lock().push(messages.to_vec());
        let (n, _guard) = self.enter().await;
        match self.fail {
            FailMode::Always | FailMode::TextAlways => anyhow::bail!("scripted failure"),
            FailMode::First(k) if n < k => anyhow::bail!("scripted failure #{n}"),
            _ => {}
        }
        let task = messages.last().map(Message::text).unwrap_or_default();
        Ok(format!("finding for: {task}"))
    }

    async fn invoke_structured(
        &self,
        messages: &[Message],
        _schema: &OutputSchema,
    ) -> anyhow::Result<serde_json::Value> {
        self.structured_log.lock().push(messages.to_vec());
        let (n, _guard) = self.enter().await;
        match self.fail {
            FailMode::Always | FailMode::StructuredAlways => {
                anyhow::bail!("scripted structured failure")
            }
            FailMode::First(k) if n < k => anyhow::bail!("scripted failure #{n}"),
            _ => {}
        }
        let next = self.queued.lock().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}
