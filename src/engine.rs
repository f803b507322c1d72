use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    error::InferenceError,
    inference::run_generation,
    lifecycle::LoadPlan,
    message::MessageSequence,
    model::{Processor, VisionLanguageModel},
};

/// Anything that turns a message sequence into generated text.
pub trait TextGenerator: Send + Sync {
    fn generate(
        &self,
        messages: &MessageSequence,
        max_new_tokens: usize,
    ) -> Result<String, InferenceError>;
}

impl<T: TextGenerator + ?Sized> TextGenerator for Arc<T> {
    fn generate(
        &self,
        messages: &MessageSequence,
        max_new_tokens: usize,
    ) -> Result<String, InferenceError> {
        (**self).generate(messages, max_new_tokens)
    }
}

/// Loaded model together with the plan it was materialized from.
pub struct ModelHandle {
    pub model: Box<dyn VisionLanguageModel>,
    pub plan: LoadPlan,
    /// Wall-clock time the load took.
    pub load_time: Duration,
}

pub type ProcessorHandle = Arc<dyn Processor>;

#[derive(Clone, Debug, PartialEq)]
pub enum EngineState {
    Idle,
    Processing,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Processing => "processing",
        }
    }
}

struct GenerationJob {
    id: u64,
    messages: MessageSequence,
    max_new_tokens: usize,
    deadline: Option<Instant>,
    reply: mpsc::Sender<Result<String, InferenceError>>,
}

/// Owns the model on a dedicated worker thread and runs one generation at a
/// time, whatever the number of callers.
///
/// The model is only ever touched by the worker.
pub struct InferenceEngine {
    state: Arc<Mutex<EngineState>>,
    req_tx: Option<mpsc::Sender<GenerationJob>>,
    inference_handle: Option<JoinHandle<()>>,
    id_counter: AtomicU64,
    plan: LoadPlan,
    load_time: Duration,
    timeout: Duration,
}

impl InferenceEngine {
    /// Moves the model onto a new worker thread.
    ///
    /// Callers waiting longer than `timeout` for a result get
    /// [`InferenceError::Timeout`].
    pub fn new(handle: ModelHandle, processor: ProcessorHandle, timeout: Duration) -> Self {
        let (req_tx, req_rx) = mpsc::channel::<GenerationJob>();
        let state = Arc::new(Mutex::new(EngineState::Idle));
        let ModelHandle {
            mut model,
            plan,
            load_time,
        } = handle;

        let inference_handle = std::thread::spawn({
            let state = state.clone();
            move || {
                while let Ok(job) = req_rx.recv() {
                    if job.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        log::warn!("Skipping inference {}: caller already timed out", job.id);
                        let _ = job.reply.send(Err(InferenceError::Timeout(timeout)));
                        continue;
                    }

                    log::debug!("Running inference {}", job.id);
                    set_state(&state, EngineState::Processing);
                    let start_time = Instant::now();

                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        run_generation(
                            model.as_mut(),
                            processor.as_ref(),
                            &job.messages,
                            job.max_new_tokens,
                        )
                    }))
                    .unwrap_or_else(|payload| {
                        Err(InferenceError::Panicked(panic_message(payload)))
                    });

                    // Released on every path so memory never carries over
                    // into the next request.
                    model.release_cache();

                    match &result {
                        Ok(_) => log::debug!(
                            "Inference {} completed in {:?}",
                            job.id,
                            start_time.elapsed()
                        ),
                        Err(e) => log::warn!("Inference {} failed: {e}", job.id),
                    }

                    let _ = job.reply.send(result);
                    set_state(&state, EngineState::Idle);
                }
                log::debug!("Inference worker stopped");
            }
        });

        Self {
            state,
            req_tx: Some(req_tx),
            inference_handle: Some(inference_handle),
            id_counter: AtomicU64::new(0),
            plan,
            load_time,
            timeout,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn plan(&self) -> &LoadPlan {
        &self.plan
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    /// Queues a generation call and blocks until it finishes or times out.
    pub fn generate(
        &self,
        messages: &MessageSequence,
        max_new_tokens: usize,
    ) -> Result<String, InferenceError> {
        let tx = self
            .req_tx
            .as_ref()
            .ok_or(InferenceError::WorkerUnavailable)?;
        let (reply, reply_rx) = mpsc::channel();
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);

        tx.send(GenerationJob {
            id,
            messages: messages.clone(),
            max_new_tokens,
            deadline: Instant::now().checked_add(self.timeout),
            reply,
        })
        .map_err(|_| InferenceError::WorkerUnavailable)?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("Inference {id} exceeded {:?}", self.timeout);
                Err(InferenceError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(InferenceError::WorkerUnavailable),
        }
    }

    /// Stops the worker after it drains the queued jobs.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(handle) = self.inference_handle.take() {
            let _ = handle.join();
        }
    }
}

impl TextGenerator for InferenceEngine {
    fn generate(
        &self,
        messages: &MessageSequence,
        max_new_tokens: usize,
    ) -> Result<String, InferenceError> {
        InferenceEngine::generate(self, messages, max_new_tokens)
    }
}

impl fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("state", &self.state())
            .field("plan", &self.plan)
            .field("load_time", &self.load_time)
            .field("timeout", &self.timeout)
            .field("running", &self.req_tx.is_some())
            .finish()
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<EngineState>, next: EngineState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
