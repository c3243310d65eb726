//! Scripted AI caller for engine tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use recap_ai::{AiCaller, AiError, AnalysisResult};

#[derive(Default)]
pub(crate) struct ScriptedCaller {
    provider: Option<String>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    transient_budget: AtomicU32,
    always_transient: bool,
    permanent_markers: Vec<String>,
    latency: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    texts: Mutex<Vec<String>>,
}

impl ScriptedCaller {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub(crate) fn always_transient(mut self) -> Self {
        self.always_transient = true;
        self
    }

    /// Fail permanently for any text containing one of `markers`.
    pub(crate) fn fail_permanently_for<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permanent_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    /// The first `n` calls (across all texts) fail transiently.
    pub(crate) fn transient_failures_before_success(self, n: u32) -> Self {
        self.transient_budget.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Calls block until the returned semaphore hands out a permit.
    pub(crate) fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiCaller for ScriptedCaller {
    fn provider(&self) -> &str {
        self.provider.as_deref().unwrap_or("scripted")
    }

    async fn analyze(&self, text: &str, _instructions: &str) -> Result<AnalysisResult, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().unwrap().push(text.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = if self.permanent_markers.iter().any(|m| text.contains(m.as_str())) {
            Err(AiError::permanent(format!("rejected: {text}")))
        } else if self.always_transient {
            Err(AiError::transient("connection reset"))
        } else if self
            .transient_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(AiError::RateLimited("slow down".into()))
        } else {
            Ok(AnalysisResult::new(format!("summary of {} chars", text.len())))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
