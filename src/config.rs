use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoints::EndpointManager;
use crate::message::Message;
use crate::Error;

/// Callback invoked whenever the client swallows a failure: validation
/// errors, queue overflow, oversized messages, exhausted retries, and
/// flag-definition fetch failures. The first argument is the HTTP
/// status when one exists, `-1` otherwise.
pub type OnError = Arc<dyn Fn(i32, &str) + Send + Sync>;

/// Hook run on every normalized message before it enters the pipeline.
/// Returning `None` drops the event; returning `Some` replaces the
/// message that proceeds.
pub type BeforeSend = Arc<dyn Fn(Message) -> Option<Message> + Send + Sync>;

const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_FLAG_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Process-wide client configuration. Built once through
/// [`ConfigBuilder`] and immutable afterwards.
#[derive(Clone)]
pub struct Config {
    pub(crate) api_key: String,
    pub(crate) endpoints: EndpointManager,
    pub(crate) personal_api_key: Option<String>,
    pub(crate) max_queue_size: usize,
    pub(crate) batch_size: usize,
    pub(crate) request_timeout: Duration,
    pub(crate) skip_tls_verification: bool,
    pub(crate) async_mode: bool,
    pub(crate) test_mode: bool,
    pub(crate) max_retries: u32,
    pub(crate) feature_flag_poll_interval: Duration,
    pub(crate) feature_flag_request_timeout: Duration,
    pub(crate) on_error: Option<OnError>,
    pub(crate) before_send: Option<BeforeSend>,
}

impl Config {
    pub fn builder<S: Into<String>>(api_key: S) -> ConfigBuilder {
        ConfigBuilder::new(api_key)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn report_error(&self, status: i32, message: &str) {
        tracing::warn!(status, error = message, "posthog client error");
        if let Some(on_error) = &self.on_error {
            on_error(status, message);
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoints", &self.endpoints)
            .field("personal_api_key", &self.personal_api_key.is_some())
            .field("max_queue_size", &self.max_queue_size)
            .field("batch_size", &self.batch_size)
            .field("request_timeout", &self.request_timeout)
            .field("skip_tls_verification", &self.skip_tls_verification)
            .field("async_mode", &self.async_mode)
            .field("test_mode", &self.test_mode)
            .field("max_retries", &self.max_retries)
            .field(
                "feature_flag_poll_interval",
                &self.feature_flag_poll_interval,
            )
            .field(
                "feature_flag_request_timeout",
                &self.feature_flag_request_timeout,
            )
            .finish()
    }
}

/// Builder for [`Config`] with validation at `build` time.
pub struct ConfigBuilder {
    api_key: String,
    host: Option<String>,
    personal_api_key: Option<String>,
    max_queue_size: usize,
    batch_size: usize,
    request_timeout: Duration,
    skip_tls_verification: bool,
    async_mode: bool,
    test_mode: bool,
    max_retries: u32,
    feature_flag_poll_interval: Duration,
    feature_flag_request_timeout: Duration,
    on_error: Option<OnError>,
    before_send: Option<BeforeSend>,
}

impl ConfigBuilder {
    pub fn new<S: Into<String>>(api_key: S) -> Self {
        Self {
            api_key: api_key.into(),
            host: None,
            personal_api_key: None,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            skip_tls_verification: false,
            async_mode: true,
            test_mode: false,
            max_retries: DEFAULT_MAX_RETRIES,
            feature_flag_poll_interval: DEFAULT_POLL_INTERVAL,
            feature_flag_request_timeout: DEFAULT_FLAG_REQUEST_TIMEOUT,
            on_error: None,
            before_send: None,
        }
    }

    /// API host. Accepts a bare host or a full endpoint URL; well-known
    /// app hosts are aliased to their ingestion endpoints.
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Personal API key. Setting one enables local flag evaluation and
    /// starts the definition poller.
    pub fn personal_api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.personal_api_key = Some(key.into());
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn skip_tls_verification(mut self, skip: bool) -> Self {
        self.skip_tls_verification = skip;
        self
    }

    /// When false, events are sent on the caller's task instead of
    /// through the background worker.
    pub fn async_mode(mut self, enabled: bool) -> Self {
        self.async_mode = enabled;
        self
    }

    /// When true, ingestion methods validate and normalize but never
    /// send anything.
    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn feature_flag_poll_interval(mut self, interval: Duration) -> Self {
        self.feature_flag_poll_interval = interval;
        self
    }

    pub fn feature_flag_request_timeout(mut self, timeout: Duration) -> Self {
        self.feature_flag_request_timeout = timeout;
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn before_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
    {
        self.before_send = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Config, Error> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Config("api_key must be given".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Config(
                "max_queue_size must be at least 1".to_string(),
            ));
        }

        let endpoints = EndpointManager::new(self.host.as_deref())?;

        Ok(Config {
            api_key: self.api_key,
            endpoints,
            personal_api_key: self.personal_api_key,
            max_queue_size: self.max_queue_size,
            batch_size: self.batch_size,
            request_timeout: self.request_timeout,
            skip_tls_verification: self.skip_tls_verification,
            async_mode: self.async_mode,
            test_mode: self.test_mode,
            max_retries: self.max_retries,
            feature_flag_poll_interval: self.feature_flag_poll_interval,
            feature_flag_request_timeout: self.feature_flag_request_timeout,
            on_error: self.on_error,
            before_send: self.before_send,
        })
    }
}
