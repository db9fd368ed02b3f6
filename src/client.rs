use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace};

use crate::batch::{BatchAdd, MessageBatch};
use crate::config::Config;
use crate::event::{Event, Properties};
use crate::exception::Exception;
use crate::feature_flags::{FlagResult, FlagValue};
use crate::flag_service::{FlagCallEvent, FlagOptions, FlagService};
use crate::message::Message;
use crate::transport::{SharedTransport, Transport};
use crate::worker::{Control, Worker, WorkerState};
use crate::Error;

/// How often `flush` and `shutdown` re-check for quiescence.
const QUIESCENCE_POLL: Duration = Duration::from_millis(10);

/// The public client: validates and enqueues events, owns the
/// background worker and flag poller, and answers flag queries.
///
/// Ingestion methods never block on network I/O and never raise; every
/// failure turns into a `false` return plus an `on_error` callback.
pub struct Client {
    config: Arc<Config>,
    transport: SharedTransport,
    messages: mpsc::Sender<Message>,
    control: mpsc::Sender<Control>,
    state: WorkerState,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    flags: FlagService,
    shutdown_done: AtomicBool,
}

impl Client {
    /// Build the client and start its background tasks. When a
    /// personal API key is configured, the first flag-definition fetch
    /// completes before this returns, so immediate flag queries can be
    /// answered locally.
    pub async fn new(config: Config) -> Result<Self, Error> {
        let config = Arc::new(config);
        let transport: SharedTransport = Arc::new(Transport::new(&config)?);

        let (message_tx, message_rx) = mpsc::channel(config.max_queue_size);
        let (control_tx, control_rx) = mpsc::channel(2);
        let state = WorkerState::new();

        let worker = if config.async_mode {
            let worker = Worker::new(
                config.clone(),
                message_rx,
                control_rx,
                transport.clone(),
                state.clone(),
            );
            Some(tokio::spawn(worker.run()))
        } else {
            state.running.store(false, Ordering::SeqCst);
            None
        };

        let flags = FlagService::new(config.clone())?;
        flags.start().await;

        Ok(Self {
            config,
            transport,
            messages: message_tx,
            control: control_tx,
            state,
            worker: Mutex::new(worker),
            flags,
            shutdown_done: AtomicBool::new(false),
        })
    }

    // ==================== Ingestion ====================

    /// Capture an analytics event.
    #[instrument(skip(self, event), level = "debug")]
    pub async fn capture(&self, event: Event) -> bool {
        self.normalize_and_dispatch(Message::capture(event)).await
    }

    /// Set person properties for a distinct id.
    pub async fn identify(&self, distinct_id: &str, properties: Properties) -> bool {
        self.normalize_and_dispatch(Message::identify(distinct_id, properties))
            .await
    }

    /// Link an alias to a distinct id.
    pub async fn alias(&self, distinct_id: &str, alias: &str) -> bool {
        self.normalize_and_dispatch(Message::alias(distinct_id, alias))
            .await
    }

    /// Set group properties. When `distinct_id` is `None` a synthetic
    /// `$<group_type>_<group_key>` id is used.
    pub async fn group_identify(
        &self,
        group_type: &str,
        group_key: &str,
        properties: Properties,
        distinct_id: Option<&str>,
    ) -> bool {
        self.normalize_and_dispatch(Message::group_identify(
            group_type,
            group_key,
            properties,
            distinct_id,
        ))
        .await
    }

    /// Capture an exception event with a structured stack trace.
    pub async fn capture_exception(
        &self,
        distinct_id: &str,
        exception: Exception,
        properties: Properties,
    ) -> bool {
        self.normalize_and_dispatch(Message::exception(distinct_id, &exception, properties))
            .await
    }

    async fn normalize_and_dispatch(&self, message: Result<Message, Error>) -> bool {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                self.config.report_error(-1, &e.to_string());
                return false;
            }
        };
        self.dispatch(message, true).await
    }

    /// Route a normalized message into the pipeline. `respect_shutdown`
    /// is false only for the flag-called events emitted by `shutdown`
    /// itself.
    async fn dispatch(&self, message: Message, respect_shutdown: bool) -> bool {
        if respect_shutdown && self.is_shutdown() {
            self.config.report_error(-1, "client is shut down");
            return false;
        }

        let message = match &self.config.before_send {
            Some(hook) => match hook(message) {
                Some(message) => message,
                None => {
                    trace!("before_send dropped event");
                    return false;
                }
            },
            None => message,
        };

        if self.config.test_mode {
            trace!(event = %message.event, "test mode, not sending");
            return true;
        }

        if self.config.async_mode {
            self.enqueue(message)
        } else {
            self.send_single(message).await
        }
    }

    /// Non-blocking enqueue with a drop-newest overflow policy.
    fn enqueue(&self, message: Message) -> bool {
        if self.state.queue_depth.load(Ordering::SeqCst) >= self.config.max_queue_size {
            self.config.report_error(-1, "queue full");
            return false;
        }

        self.state.queue_depth.fetch_add(1, Ordering::SeqCst);
        match self.messages.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                self.state.queue_depth.fetch_sub(1, Ordering::SeqCst);
                self.config.report_error(-1, "queue full");
                false
            }
        }
    }

    /// Sync-mode path: a one-message batch sent on the caller's task.
    async fn send_single(&self, message: Message) -> bool {
        let mut batch = MessageBatch::new(1);
        match batch.add(&message) {
            Ok(BatchAdd::Added) => {}
            Ok(BatchAdd::MessageTooLarge(size)) => {
                self.config
                    .report_error(-1, &format!("message too large: {size} bytes"));
                return false;
            }
            Ok(BatchAdd::BatchFull) => {
                self.config.report_error(-1, "message does not fit a batch");
                return false;
            }
            Err(e) => {
                self.config.report_error(-1, &e.to_string());
                return false;
            }
        }

        let payload = match batch.payload(&self.config.api_key) {
            Ok(payload) => payload,
            Err(e) => {
                self.config.report_error(-1, &e.to_string());
                return false;
            }
        };

        let response = self.transport.send(&payload).await;
        if !response.success() {
            self.config
                .report_error(response.status, &response.error_message());
            return false;
        }
        true
    }

    // ==================== Feature flags ====================

    /// The decided value of a flag, or `None` when no decision could
    /// be made.
    pub async fn get_feature_flag(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<FlagValue> {
        self.get_feature_flag_result(key, distinct_id, options)
            .await
            .and_then(|result| result.value)
    }

    /// The full decision record for a flag, including payload and
    /// evaluation metadata.
    pub async fn get_feature_flag_result(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<FlagResult> {
        self.flags.get_flag(key, distinct_id, options).await
    }

    /// Whether a flag is enabled (boolean true or any variant).
    pub async fn feature_flag_enabled(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<bool> {
        self.get_feature_flag(key, distinct_id, options)
            .await
            .map(|value| value.is_enabled())
    }

    /// The payload attached to the subject's decided flag value.
    pub async fn get_feature_flag_payload(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<Value> {
        self.get_feature_flag_result(key, distinct_id, options)
            .await
            .and_then(|result| result.payload)
    }

    /// All decided flag values for a subject.
    pub async fn get_all_flags(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<HashMap<String, FlagValue>> {
        let results = self.flags.get_all_flags(distinct_id, options).await?;
        Some(
            results
                .into_iter()
                .filter_map(|(key, result)| result.value.map(|value| (key, value)))
                .collect(),
        )
    }

    /// All decided flag values plus their payloads.
    pub async fn get_all_flags_and_payloads(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<(HashMap<String, FlagValue>, HashMap<String, Value>)> {
        let results = self.flags.get_all_flags(distinct_id, options).await?;
        let mut values = HashMap::new();
        let mut payloads = HashMap::new();
        for (key, result) in results {
            if let Some(payload) = result.payload {
                payloads.insert(key.clone(), payload);
            }
            if let Some(value) = result.value {
                values.insert(key, value);
            }
        }
        Some((values, payloads))
    }

    /// Refresh the flag-definition cache now instead of waiting for
    /// the next poll.
    pub async fn reload_feature_flags(&self) {
        self.flags.reload().await;
    }

    pub fn local_evaluation_enabled(&self) -> bool {
        self.flags.local_evaluation_enabled()
    }

    // ==================== Lifecycle ====================

    /// Number of messages waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.state.queue_depth.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_done.load(Ordering::SeqCst)
    }

    /// Block until everything enqueued so far has been handed to the
    /// transport. Returns immediately when the queue is already empty.
    pub async fn flush(&self) {
        if !self.config.async_mode {
            return;
        }

        let _ = self.control.try_send(Control::Flush);
        while !self.state.idle() && self.state.running.load(Ordering::SeqCst) {
            tokio::time::sleep(QUIESCENCE_POLL).await;
        }
    }

    /// Drain pending flag-called telemetry, stop the worker after it
    /// has delivered every enqueued message, and stop the poller.
    /// Idempotent; the second call returns immediately.
    pub async fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down client");

        for call in self.flags.drain_flag_call_events() {
            self.capture_flag_call(call).await;
        }

        if self.config.async_mode {
            let _ = self.control.send(Control::Shutdown).await;
            let worker = self.worker.lock().unwrap().take();
            if let Some(worker) = worker {
                let _ = worker.await;
            }
        }

        self.flags.stop().await;
        debug!("client shut down");
    }

    async fn capture_flag_call(&self, call: FlagCallEvent) {
        let mut event = Event::new("$feature_flag_called", call.distinct_id.as_str());
        event.properties = call.event_properties();
        match Message::capture(event) {
            Ok(message) => {
                self.dispatch(message, false).await;
            }
            Err(e) => self.config.report_error(-1, &e.to_string()),
        }
    }
}
