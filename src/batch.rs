use serde::Serialize;
use serde_json::value::RawValue;

use crate::message::Message;
use crate::Error;

/// Hard cap on a single encoded message.
pub(crate) const MAX_MESSAGE_BYTES: usize = 32_768;
/// Hard cap on the encoded batch array.
pub(crate) const MAX_BATCH_BYTES: usize = 500_000;

/// Outcome of [`MessageBatch::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAdd {
    /// The message was accepted.
    Added,
    /// Adding would exceed the count or byte limit; flush first.
    BatchFull,
    /// The message alone exceeds the per-message limit and can never
    /// be sent; carries the encoded size.
    MessageTooLarge(usize),
}

#[derive(Serialize)]
struct BatchPayload<'a> {
    api_key: &'a str,
    batch: &'a [Box<RawValue>],
}

/// Size-bounded accumulator of encoded messages.
///
/// Each message is encoded exactly once on `add`; the running byte
/// size tracks the final encoded array, starting at 2 for the
/// surrounding brackets and adding one separator byte per non-first
/// element.
pub struct MessageBatch {
    items: Vec<Box<RawValue>>,
    bytes: usize,
    max_messages: usize,
}

impl MessageBatch {
    pub fn new(max_messages: usize) -> Self {
        Self {
            items: Vec::new(),
            bytes: 2,
            max_messages,
        }
    }

    pub fn add(&mut self, message: &Message) -> Result<BatchAdd, Error> {
        let encoded =
            serde_json::to_string(message).map_err(|e| Error::Serialization(e.to_string()))?;

        if encoded.len() > MAX_MESSAGE_BYTES {
            return Ok(BatchAdd::MessageTooLarge(encoded.len()));
        }

        let separator = usize::from(!self.items.is_empty());
        if self.items.len() >= self.max_messages
            || self.bytes + separator + encoded.len() > MAX_BATCH_BYTES
        {
            return Ok(BatchAdd::BatchFull);
        }

        self.bytes += separator + encoded.len();
        self.items.push(
            RawValue::from_string(encoded).map_err(|e| Error::Serialization(e.to_string()))?,
        );
        Ok(BatchAdd::Added)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_messages || self.bytes >= MAX_BATCH_BYTES
    }

    /// Encoded byte size of the batch array, brackets included.
    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.bytes = 2;
    }

    /// Render the full ingestion payload.
    pub fn payload(&self, api_key: &str) -> Result<String, Error> {
        serde_json::to_string(&BatchPayload {
            api_key,
            batch: &self.items,
        })
        .map_err(|e| Error::Serialization(e.to_string()))
    }
}
