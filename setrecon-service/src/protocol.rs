//! Peer-to-peer protocol messages.
//!
//! One channel carries exactly one operation. The initiator opens it with
//! [`ReconMessage::OperationRequest`]; everything after that belongs to the
//! union or intersection protocol selected by the request.

use serde::{Deserialize, Serialize};
use setrecon_sketch::{IbfKey, IBF_BUCKET_SIZE};
use setrecon_types::{AppId, Element, ElementHash, OperationType};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest IBF slice carried by one message.
pub const MAX_BUCKETS_PER_MESSAGE: usize = 32_768 / IBF_BUCKET_SIZE;

/// Largest Bloom filter chunk carried by one message.
pub const MAX_BF_BYTES_PER_MESSAGE: usize = 32 * 1024;

/// Hashes per offer or demand message.
pub const MAX_HASHES_PER_MESSAGE: usize = 256;

/// Keys per inquiry message.
pub const MAX_KEYS_PER_INQUIRY: usize = 1024;

/// A reconciliation protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconMessage {
    /// First message on a channel.
    OperationRequest(OperationRequestMessage),

    // ── union ──
    /// Raw strata estimator of the sender's set.
    StrataEstimator(StrataMessage),
    /// Compressed strata estimator of the sender's set.
    StrataEstimatorCompressed(StrataMessage),
    /// A contiguous slice of an IBF.
    Ibf(IbfMessage),
    /// An element sent in response to a demand.
    Elements(Element),
    /// An element sent during full-set transmission.
    FullElement(Element),
    /// "I have these elements."
    Offer(Vec<ElementHash>),
    /// "Which elements do you have for these keys?"
    Inquiry(InquiryMessage),
    /// "Send me these elements."
    Demand(Vec<ElementHash>),
    /// The sender has finished its part of the inventory exchange.
    Done,
    /// Ask the peer to send its full set.
    RequestFull,
    /// End of a full-set transmission.
    FullDone,

    // ── intersection ──
    /// The acceptor's element count, when the initiator should send the
    /// first filter.
    ElementInfo(ElementInfoMessage),
    /// A chunk of a Bloom filter over the sender's remaining elements.
    BloomFilter(BloomFilterMessage),
    /// The sender believes the intersection is complete.
    IntersectionDone(IntersectionDoneMessage),
}

impl ReconMessage {
    /// Short name used in logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OperationRequest(_) => "OPERATION_REQUEST",
            Self::StrataEstimator(_) => "STRATA_ESTIMATOR",
            Self::StrataEstimatorCompressed(_) => "STRATA_ESTIMATOR_COMPRESSED",
            Self::Ibf(_) => "IBF",
            Self::Elements(_) => "ELEMENTS",
            Self::FullElement(_) => "FULL_ELEMENT",
            Self::Offer(_) => "OFFER",
            Self::Inquiry(_) => "INQUIRY",
            Self::Demand(_) => "DEMAND",
            Self::Done => "DONE",
            Self::RequestFull => "REQUEST_FULL",
            Self::FullDone => "FULL_DONE",
            Self::ElementInfo(_) => "ELEMENT_INFO",
            Self::BloomFilter(_) => "BF",
            Self::IntersectionDone(_) => "INTERSECTION_DONE",
        }
    }
}

/// Opens an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequestMessage {
    pub version: u32,
    pub operation: OperationType,
    /// Sender's element count at the operation's generation.
    pub element_count: u64,
    pub app_id: AppId,
    /// Opaque application context shown to the listener.
    #[serde(default, with = "hex_bytes_opt")]
    pub context: Option<Vec<u8>>,
}

impl OperationRequestMessage {
    pub fn new(operation: OperationType, app_id: AppId, element_count: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            operation,
            element_count,
            app_id,
            context: None,
        }
    }

    /// Attaches an application context.
    pub fn with_context(mut self, context: Option<Vec<u8>>) -> Self {
        self.context = context;
        self
    }
}

/// Strata estimator payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrataMessage {
    /// Sender's element count.
    pub set_size: u64,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// IBF slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbfMessage {
    /// The full IBF has `2^order` buckets.
    pub order: u8,
    /// Index of the first bucket in this slice.
    pub offset: u32,
    /// Salt applied to every key in the IBF.
    pub salt: u32,
    /// Serialized buckets.
    #[serde(with = "hex_bytes")]
    pub buckets: Vec<u8>,
}

/// Keys the sender decoded as present only at the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InquiryMessage {
    /// Salt of the IBF the keys were decoded from.
    pub salt: u32,
    /// Unsalted keys.
    pub keys: Vec<IbfKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfoMessage {
    pub sender_element_count: u64,
}

/// Bloom filter chunk. Chunks are concatenated in order until
/// `total_len` bytes were received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilterMessage {
    pub sender_element_count: u64,
    pub element_xor_hash: ElementHash,
    pub salt: u32,
    pub total_len: u32,
    pub bits_per_element: u32,
    #[serde(with = "hex_bytes")]
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntersectionDoneMessage {
    pub final_element_count: u64,
    pub element_xor_hash: ElementHash,
}

/// Byte payloads travel as hex strings inside the JSON body.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| hex::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
