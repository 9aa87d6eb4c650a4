//! Quote wire format
//!
//! The byte layout every oracle signs. All integers are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       1     version
//! 1       32    queue id
//! 33      8     slot
//! 41      8     timestamp_ms
//! 49      1     feed count N
//! 50      49*N  feed entries: feed id (32) | value i128 (16) | min samples (1)
//! ```
//!
//! A bundle concatenates several signed responses into one byte string:
//!
//! ```text
//! count (1), then per response: oracle (32) | signature (64) | len u16 (2) | message
//! ```

use crate::error::{DecodeError, EncodeError};
use crate::fixed_point::FixedPoint;
use crate::types::{FeedId, OracleKey, Quote, QueueId};
use crate::verifier::{RawOracleResponse, VerifiedResponse, SIGNATURE_LEN};
use std::collections::BTreeSet;

pub const VERSION: u8 = 1;

/// Bytes before the first feed entry.
pub const HEADER_LEN: usize = 50;

pub const FEED_ENTRY_LEN: usize = 49;

pub const MAX_FEEDS_PER_MESSAGE: usize = 32;

pub const MAX_MESSAGE_LEN: usize = HEADER_LEN + MAX_FEEDS_PER_MESSAGE * FEED_ENTRY_LEN;

const QUEUE_OFFSET: usize = 1;

/// One feed's entry in a signed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedValue {
    pub feed_id: FeedId,
    pub value: FixedPoint,
    pub min_oracle_samples: u8,
}

/// The decoded content of one signed message, before it is split into quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteMessage {
    pub queue: QueueId,
    pub slot: u64,
    pub timestamp_ms: u64,
    pub feeds: Vec<FeedValue>,
}

// ============================================================================
// Messages
// ============================================================================

pub fn encode_message(message: &QuoteMessage) -> Result<Vec<u8>, EncodeError> {
    let count = message.feeds.len();
    if count == 0 {
        return Err(EncodeError::EmptyFeedList);
    }
    if count > MAX_FEEDS_PER_MESSAGE {
        return Err(EncodeError::TooManyFeeds(count));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + count * FEED_ENTRY_LEN);
    out.push(VERSION);
    out.extend_from_slice(message.queue.as_bytes());
    out.extend_from_slice(&message.slot.to_le_bytes());
    out.extend_from_slice(&message.timestamp_ms.to_le_bytes());
    out.push(count as u8);
    for feed in &message.feeds {
        out.extend_from_slice(feed.feed_id.as_bytes());
        out.extend_from_slice(&feed.value.raw().to_le_bytes());
        out.push(feed.min_oracle_samples);
    }
    Ok(out)
}

pub fn decode_message(bytes: &[u8]) -> Result<QuoteMessage, DecodeError> {
    let mut reader = Reader::new(bytes);

    let version = reader.u8()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let queue = QueueId::new(reader.array()?);
    let slot = u64::from_le_bytes(reader.array()?);
    let timestamp_ms = u64::from_le_bytes(reader.array()?);

    let count = reader.u8()? as usize;
    if count == 0 {
        return Err(DecodeError::EmptyFeedList);
    }
    if count > MAX_FEEDS_PER_MESSAGE {
        return Err(DecodeError::TooManyFeeds(count));
    }
    reader.require(count * FEED_ENTRY_LEN)?;

    let mut seen = BTreeSet::new();
    let mut feeds = Vec::with_capacity(count);
    for _ in 0..count {
        let feed_id = FeedId::new(reader.array()?);
        let value = FixedPoint::from_raw(i128::from_le_bytes(reader.array()?));
        let min_oracle_samples = reader.u8()?;
        if !seen.insert(feed_id) {
            return Err(DecodeError::DuplicateFeed(feed_id));
        }
        feeds.push(FeedValue {
            feed_id,
            value,
            min_oracle_samples,
        });
    }

    reader.finish()?;

    Ok(QuoteMessage {
        queue,
        slot,
        timestamp_ms,
        feeds,
    })
}

/// Split a verified response into one quote per feed it carries.
pub fn decode(verified: &VerifiedResponse) -> Result<Vec<Quote>, DecodeError> {
    let message = decode_message(verified.message())?;
    let oracle = verified.oracle();

    Ok(message
        .feeds
        .into_iter()
        .map(|feed| Quote {
            feed_id: feed.feed_id,
            value: feed.value,
            slot: message.slot,
            timestamp_ms: message.timestamp_ms,
            oracle,
            min_oracle_samples: feed.min_oracle_samples,
        })
        .collect())
}

/// Queue id named in a message header, if the header is long enough.
pub(crate) fn signed_queue(message: &[u8]) -> Option<QueueId> {
    message
        .get(QUEUE_OFFSET..QUEUE_OFFSET + QueueId::LEN)
        .and_then(QueueId::from_slice)
}

// ============================================================================
// Bundles
// ============================================================================

pub fn encode_bundle(responses: &[RawOracleResponse]) -> Result<Vec<u8>, EncodeError> {
    let count = u8::try_from(responses.len())
        .map_err(|_| EncodeError::TooManyResponses(responses.len()))?;

    let mut out = vec![count];
    for response in responses {
        if response.signature.len() != SIGNATURE_LEN {
            return Err(EncodeError::SignatureLength(response.signature.len()));
        }
        let len = u16::try_from(response.message.len())
            .map_err(|_| EncodeError::MessageTooLong(response.message.len()))?;

        out.extend_from_slice(response.oracle.as_bytes());
        out.extend_from_slice(&response.signature);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&response.message);
    }
    Ok(out)
}

/// Split a bundle into raw responses. Nothing is verified here.
pub fn decode_bundle(bytes: &[u8]) -> Result<Vec<RawOracleResponse>, DecodeError> {
    let mut reader = Reader::new(bytes);
    let count = reader.u8()? as usize;

    let mut responses = Vec::with_capacity(count);
    for _ in 0..count {
        let oracle = OracleKey::new(reader.array()?);
        let signature = reader.take(SIGNATURE_LEN)?.to_vec();
        let len = u16::from_le_bytes(reader.array()?) as usize;
        let message = reader.take(len)?.to_vec();
        responses.push(RawOracleResponse {
            oracle,
            signature,
            message,
        });
    }

    reader.finish()?;
    Ok(responses)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn require(&self, len: usize) -> Result<(), DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                needed: self.pos + len,
                available: self.bytes.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.require(len)?;
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
