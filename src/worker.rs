use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::batch::{BatchAdd, MessageBatch};
use crate::config::Config;
use crate::message::Message;
use crate::transport::SharedTransport;

/// Control messages delivered out of band from the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Drain the queue and send whatever is batched.
    Flush,
    /// Flush, then stop the worker.
    Shutdown,
}

/// Counters shared between the worker and the client facade so that
/// `flush` and `shutdown` can observe quiescence without locking.
#[derive(Clone, Default)]
pub(crate) struct WorkerState {
    /// Messages sitting in the channel, not yet dequeued.
    pub queue_depth: Arc<AtomicUsize>,
    /// Messages dequeued into the current batch, not yet sent.
    pub batched: Arc<AtomicUsize>,
    /// Whether a transport request is in flight.
    pub sending: Arc<AtomicBool>,
    /// Whether the worker loop is alive.
    pub running: Arc<AtomicBool>,
}

impl WorkerState {
    pub fn new() -> Self {
        let state = Self::default();
        state.running.store(true, Ordering::SeqCst);
        state
    }

    /// True when nothing is queued, batched, or in flight.
    pub fn idle(&self) -> bool {
        self.queue_depth.load(Ordering::SeqCst) == 0
            && self.batched.load(Ordering::SeqCst) == 0
            && !self.sending.load(Ordering::SeqCst)
    }
}

/// Background consumer: batches queued messages and hands full batches
/// to the transport. Runs until a `Shutdown` control message arrives
/// or both channels close; enqueued messages are never dropped on the
/// way out.
pub(crate) struct Worker {
    config: Arc<Config>,
    messages: mpsc::Receiver<Message>,
    control: mpsc::Receiver<Control>,
    transport: SharedTransport,
    batch: MessageBatch,
    state: WorkerState,
}

impl Worker {
    pub fn new(
        config: Arc<Config>,
        messages: mpsc::Receiver<Message>,
        control: mpsc::Receiver<Control>,
        transport: SharedTransport,
        state: WorkerState,
    ) -> Self {
        let batch = MessageBatch::new(config.batch_size);
        Self {
            config,
            messages,
            control,
            transport,
            batch,
            state,
        }
    }

    pub async fn run(mut self) {
        debug!("ingestion worker started");

        loop {
            tokio::select! {
                message = self.messages.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        // Producers are gone; deliver what's left.
                        self.drain_and_flush().await;
                        break;
                    }
                },
                control = self.control.recv() => match control {
                    Some(Control::Flush) => self.drain_and_flush().await,
                    Some(Control::Shutdown) | None => {
                        self.drain_and_flush().await;
                        break;
                    }
                },
            }
        }

        self.state.running.store(false, Ordering::SeqCst);
        debug!("ingestion worker stopped");
    }

    async fn handle_message(&mut self, message: Message) {
        self.state.queue_depth.fetch_sub(1, Ordering::SeqCst);

        match self.batch.add(&message) {
            Ok(BatchAdd::Added) => {
                self.state.batched.fetch_add(1, Ordering::SeqCst);
                if self.batch.is_full() {
                    self.flush_batch().await;
                }
            }
            Ok(BatchAdd::BatchFull) => {
                self.flush_batch().await;
                match self.batch.add(&message) {
                    Ok(BatchAdd::Added) => {
                        self.state.batched.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(BatchAdd::MessageTooLarge(size)) => self.drop_oversized(size),
                    Ok(BatchAdd::BatchFull) => {
                        self.config
                            .report_error(-1, "message does not fit an empty batch");
                    }
                    Err(e) => self.config.report_error(-1, &e.to_string()),
                }
            }
            Ok(BatchAdd::MessageTooLarge(size)) => self.drop_oversized(size),
            Err(e) => self.config.report_error(-1, &e.to_string()),
        }
    }

    fn drop_oversized(&self, size: usize) {
        self.config
            .report_error(-1, &format!("message too large: {size} bytes"));
    }

    /// Pull everything already queued without blocking, then send.
    async fn drain_and_flush(&mut self) {
        while let Ok(message) = self.messages.try_recv() {
            self.handle_message(message).await;
        }
        self.flush_batch().await;
    }

    async fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let payload = match self.batch.payload(&self.config.api_key) {
            Ok(payload) => payload,
            Err(e) => {
                self.config.report_error(-1, &e.to_string());
                self.batch.clear();
                self.state.batched.store(0, Ordering::SeqCst);
                return;
            }
        };

        trace!(messages = self.batch.len(), "sending batch");
        self.state.sending.store(true, Ordering::SeqCst);
        let response = self.transport.send(&payload).await;
        self.batch.clear();
        self.state.batched.store(0, Ordering::SeqCst);
        self.state.sending.store(false, Ordering::SeqCst);

        if !response.success() {
            self.config
                .report_error(response.status, &response.error_message());
        }
    }
}
