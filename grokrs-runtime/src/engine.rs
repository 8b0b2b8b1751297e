//! Replica workers and the request queue
//!
//! The [`Engine`] owns one or more model replicas (one per data-axis row of
//! the device mesh) and serves token-level generation requests on them.
//! Each replica lives on its own long-lived worker thread; workers take
//! requests from a shared queue, so concurrent requests run data-parallel.
//!
//! Callers submit requests via [`Engine::submit`] and receive tokens through
//! a [`TokenSender`] implementation of their choice.

use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use grokrs::{Error, GenerateOptions, Model, ModelConfig, Result};

use crate::runner::{FinishReason, InferenceRunner};

/// What a worker reports back for one request.
///
/// A request yields its tokens in order and ends with one `Finished` or
/// `Error`; nothing follows the terminal event.
#[derive(Debug)]
pub enum GenerationEvent {
    /// Sampled id, excluding EOS.
    Token(u32),
    /// The request failed; its cache has been released.
    Error(Error),
    /// The request ended normally or was cancelled.
    Finished(FinishReason),
}

/// Sink for a request's [`GenerationEvent`]s.
pub trait TokenSender: Send {
    /// Deliver one event. `false` means nobody is listening any more and
    /// the worker cancels the request.
    fn send(&self, event: GenerationEvent) -> bool;
}

impl TokenSender for mpsc::Sender<GenerationEvent> {
    fn send(&self, event: GenerationEvent) -> bool {
        mpsc::Sender::send(self, event).is_ok()
    }
}

/// A generation request waiting for a worker.
struct GenerationRequest {
    id: u64,
    input_ids: Vec<u32>,
    options: GenerateOptions,
    token_tx: Box<dyn TokenSender>,
}

type RequestQueue = Arc<Mutex<mpsc::Receiver<GenerationRequest>>>;

/// Handle to the engine's worker threads.
///
/// Dropping the engine closes the queue and joins the workers once they
/// finish the requests already taken.
pub struct Engine {
    request_tx: Option<mpsc::Sender<GenerationRequest>>,
    workers: Vec<JoinHandle<()>>,
    model_config: ModelConfig,
    next_id: std::sync::atomic::AtomicU64,
}

impl Engine {
    /// Serve a single replica with the model's full sequence length.
    ///
    /// # Errors
    /// See [`Engine::with_replicas`].
    pub fn new<M: Model + 'static>(model: M) -> Result<Self> {
        Self::with_replicas(vec![model], None)
    }

    /// Serve every replica in `replicas`, one worker thread each.
    ///
    /// `max_seq_len` caps each request's KV cache (prompt plus output).
    /// When `None`, the model's maximum sequence length is used.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if `replicas` is empty, `ConfigInvalid` if
    /// the replicas disagree on their configuration, and `SequenceTooLong`
    /// if `max_seq_len` exceeds the model's.
    pub fn with_replicas<M: Model + 'static>(
        replicas: Vec<M>,
        max_seq_len: Option<usize>,
    ) -> Result<Self> {
        let Some(first) = replicas.first() else {
            return Err(Error::InvalidRequest(
                "engine needs at least one model replica".into(),
            ));
        };
        let mut model_config = first.config();
        if replicas.iter().any(|m| m.config() != model_config) {
            return Err(Error::ConfigInvalid(
                "model replicas disagree on their configuration".into(),
            ));
        }
        if let Some(max) = max_seq_len {
            if max > model_config.max_seq_len {
                return Err(Error::SequenceTooLong {
                    len: max,
                    max: model_config.max_seq_len,
                });
            }
            model_config.max_seq_len = max;
        }

        let (request_tx, request_rx) = mpsc::channel::<GenerationRequest>();
        let queue: RequestQueue = Arc::new(Mutex::new(request_rx));
        let capacity = model_config.max_seq_len;
        let workers = replicas
            .into_iter()
            .enumerate()
            .map(|(replica, model)| {
                let queue = Arc::clone(&queue);
                thread::Builder::new()
                    .name(format!("grokrs-replica-{replica}"))
                    .spawn(move || worker_loop(replica, &model, capacity, &queue))
                    .map_err(Error::Io)
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            replicas = workers.len(),
            max_seq_len = capacity,
            "engine started"
        );

        Ok(Self {
            request_tx: Some(request_tx),
            workers,
            model_config,
            next_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Model configuration; `max_seq_len` is the per-request cache capacity.
    #[must_use]
    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    /// Number of data-parallel workers.
    #[must_use]
    pub fn num_replicas(&self) -> usize {
        self.workers.len()
    }

    /// Queue `input_ids` for the next free replica.
    ///
    /// Tokens are sent through `token_tx` as they are generated, followed by
    /// one terminal event. Generation stops when the token budget or the
    /// cache capacity is reached, an EOS token is produced, or the sender
    /// returns `false` (receiver dropped).
    pub fn submit(
        &self,
        input_ids: Vec<u32>,
        options: GenerateOptions,
        token_tx: impl TokenSender + 'static,
    ) {
        let request = GenerationRequest {
            id: self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            input_ids,
            options,
            token_tx: Box::new(token_tx),
        };
        let Some(request_tx) = &self.request_tx else {
            return;
        };
        // If every worker has died the send fails and the request is
        // dropped, which closes the caller's channel.
        let _ = request_tx.send(request);
    }

    /// Run a request to completion and return the sampled ids, without the
    /// prompt and without EOS.
    ///
    /// # Errors
    /// Returns the request's error, or `InvalidState` if the engine shut
    /// down before finishing it.
    pub fn generate(&self, input_ids: &[u32], options: &GenerateOptions) -> Result<Vec<u32>> {
        self.generate_stream(input_ids, options, |rx| {
            let mut tokens = Vec::new();
            for event in rx {
                match event {
                    GenerationEvent::Token(id) => tokens.push(id),
                    GenerationEvent::Error(e) => return Err(e),
                    GenerationEvent::Finished(_) => return Ok(tokens),
                }
            }
            Err(Error::InvalidState(
                "engine stopped before the request finished".into(),
            ))
        })
    }

    /// Queue a request and hand its event receiver to `consumer`.
    ///
    /// The `consumer` closure receives the [`mpsc::Receiver`] and runs on
    /// the current thread while a worker produces tokens. Dropping the
    /// receiver early cancels the request.
    pub fn generate_stream<F, R>(
        &self,
        input_ids: &[u32],
        options: &GenerateOptions,
        consumer: F,
    ) -> R
    where
        F: FnOnce(mpsc::Receiver<GenerationEvent>) -> R,
    {
        let (tx, rx) = mpsc::channel();
        self.submit(input_ids.to_vec(), options.clone(), tx);
        consumer(rx)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.request_tx = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("engine worker panicked");
            }
        }
    }
}

/// A worker's main loop: take the next queued request, run it to the end.
fn worker_loop<M: Model>(replica: usize, model: &M, capacity: usize, queue: &RequestQueue) {
    loop {
        let next = match queue.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        let Ok(request) = next else {
            tracing::debug!(replica, "request queue closed, worker exiting");
            return;
        };
        let span = tracing::debug_span!("request", id = request.id, replica);
        let _guard = span.enter();
        process_request(model, capacity, &request);
    }
}

fn process_request<M: Model>(model: &M, capacity: usize, request: &GenerationRequest) {
    let tx = &*request.token_tx;
    let result = InferenceRunner::new(model, &request.options, Some(capacity)).and_then(
        |mut runner| runner.run(&request.input_ids, |t| tx.send(GenerationEvent::Token(t))),
    );
    match result {
        Ok(reason) => {
            tracing::debug!(?reason, "request finished");
            let _ = tx.send(GenerationEvent::Finished(reason));
        }
        Err(e) => {
            tracing::warn!(error = %e, "request failed");
            let _ = tx.send(GenerationEvent::Error(e));
        }
    }
}
