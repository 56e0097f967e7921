//! Intersection by Bloom filter reduction.
//!
//! The peers take turns sending a Bloom filter over their remaining
//! elements. The receiver drops everything the filter does not contain.
//! Once a receiver's count and xor match the sender's, the two working sets
//! are equal and the peers exchange `IntersectionDone` to confirm.

use crate::error::{ReconError, ReconResult};
use crate::operation::{OpContext, Reconciler, ResultMode, ResultStatus};
use crate::protocol::{
    BloomFilterMessage, ElementInfoMessage, IntersectionDoneMessage, ReconMessage,
    MAX_BF_BYTES_PER_MESSAGE,
};
use setrecon_sketch::{filter_size_bytes, optimal_bits_per_element, BloomFilter};
use setrecon_types::{Element, ElementHash};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntersectionPhase {
    Initial,
    /// Our count is known to the peer; waiting for its filter or count.
    CountSent,
    BfExchange,
    /// We sent `IntersectionDone` and wait for the confirmation.
    MustSendDone,
    /// We confirmed the peer's `IntersectionDone`; waiting for close.
    DoneReceived,
    Finished,
}

impl IntersectionPhase {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::CountSent => "count_sent",
            Self::BfExchange => "bf_exchange",
            Self::MustSendDone => "must_send_done",
            Self::DoneReceived => "done_received",
            Self::Finished => "finished",
        }
    }
}

/// A Bloom filter arriving in chunks.
#[derive(Debug)]
struct PartialFilter {
    data: Vec<u8>,
    total_len: usize,
    bits_per_element: u32,
    salt: u32,
    sender_count: u64,
    sender_xor: ElementHash,
}

#[derive(Debug)]
pub struct IntersectionOperation {
    phase: IntersectionPhase,
    /// Working copy, shrinking as filters arrive.
    my_elements: HashMap<ElementHash, Element>,
    my_xor: ElementHash,
    initialized: bool,
    remote_count: u64,
    /// Most elements the peer's next filter may claim; counts only shrink.
    remote_count_bound: u64,
    remote_xor: ElementHash,
    incoming: Option<PartialFilter>,
}

impl IntersectionOperation {
    pub(crate) fn new(remote_count: u64) -> Self {
        Self {
            phase: IntersectionPhase::Initial,
            my_elements: HashMap::new(),
            my_xor: ElementHash::ZERO,
            initialized: false,
            remote_count,
            remote_count_bound: remote_count,
            remote_xor: ElementHash::ZERO,
            incoming: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> IntersectionPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: IntersectionPhase) {
        debug!(from = self.phase.name(), to = phase.name(), "intersection phase");
        self.phase = phase;
    }

    fn wrong_phase(&self, message: &ReconMessage) -> ReconError {
        ReconError::WrongPhase {
            message: message.kind(),
            phase: self.phase.name(),
        }
    }

    fn my_count(&self) -> u64 {
        self.my_elements.len() as u64
    }

    /// Copies every member of the set into the working copy.
    fn initialize(&mut self, ctx: &OpContext<'_>) {
        if self.initialized {
            return;
        }
        for (hash, element) in ctx.view.iter() {
            self.my_xor ^= *hash;
            self.my_elements.insert(*hash, element.clone());
        }
        self.initialized = true;
    }

    /// Copies only the members the peer's first filter may contain.
    fn initialize_filtered(&mut self, ctx: &mut OpContext<'_>, filter: &BloomFilter, salt: u32) {
        for (hash, element) in ctx.view.iter() {
            if filter.contains(hash.salted(salt).as_bytes()) {
                self.my_xor ^= *hash;
                self.my_elements.insert(*hash, element.clone());
            } else {
                report_removed(ctx, element);
            }
        }
        self.initialized = true;
    }

    fn reduce(&mut self, ctx: &mut OpContext<'_>, filter: &BloomFilter, salt: u32) {
        let mut removed = 0usize;
        let mut xor = self.my_xor;
        self.my_elements.retain(|hash, element| {
            if filter.contains(hash.salted(salt).as_bytes()) {
                return true;
            }
            xor ^= *hash;
            removed += 1;
            report_removed(ctx, element);
            false
        });
        self.my_xor = xor;
        debug!(removed, remaining = self.my_elements.len(), "filter applied");
    }

    fn remove_all(&mut self, ctx: &mut OpContext<'_>) {
        for (_, element) in self.my_elements.drain() {
            report_removed(ctx, &element);
        }
        self.my_xor = ElementHash::ZERO;
    }

    /// Starts the filter exchange with our working copy unfiltered.
    fn begin_exchange(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        self.initialize(ctx);
        if self.my_elements.is_empty() {
            self.send_done(ctx);
            return Ok(());
        }
        self.send_filter(ctx)
    }

    fn send_filter(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        let my_count = self.my_count();
        let bits_per_element = optimal_bits_per_element(my_count, self.remote_count)
            .min(ctx.config.max_bloom_bits_per_element);
        let mut filter = BloomFilter::for_elements(self.my_elements.len(), bits_per_element)?;
        let salt: u32 = rand::random();
        for hash in self.my_elements.keys() {
            filter.insert(hash.salted(salt).as_bytes());
        }
        let bytes = filter.into_bytes();
        debug!(
            elements = my_count,
            bits_per_element,
            bytes = bytes.len(),
            "sending bloom filter"
        );
        for chunk in bytes.chunks(MAX_BF_BYTES_PER_MESSAGE) {
            ctx.send(ReconMessage::BloomFilter(BloomFilterMessage {
                sender_element_count: my_count,
                element_xor_hash: self.my_xor,
                salt,
                total_len: bytes.len() as u32,
                bits_per_element,
                chunk: chunk.to_vec(),
            }));
        }
        self.set_phase(IntersectionPhase::BfExchange);
        Ok(())
    }

    fn send_done(&mut self, ctx: &mut OpContext<'_>) {
        ctx.send(ReconMessage::IntersectionDone(IntersectionDoneMessage {
            final_element_count: self.my_count(),
            element_xor_hash: self.my_xor,
        }));
        self.set_phase(IntersectionPhase::MustSendDone);
    }

    fn handle_element_info(&mut self, ctx: &mut OpContext<'_>, msg: ElementInfoMessage) -> ReconResult<()> {
        if self.phase != IntersectionPhase::CountSent {
            return Err(self.wrong_phase(&ReconMessage::ElementInfo(msg)));
        }
        self.remote_count = msg.sender_element_count;
        self.remote_count_bound = msg.sender_element_count;
        self.begin_exchange(ctx)
    }

    /// Rejects filter headers whose size or hash count the peer could not
    /// have produced.
    fn check_filter_header(
        &self,
        msg: &BloomFilterMessage,
        max_bits_per_element: u32,
    ) -> ReconResult<()> {
        if msg.bits_per_element == 0 || msg.bits_per_element > max_bits_per_element {
            return Err(ReconError::protocol(format!(
                "bloom filter uses {} bits per element, limit is {max_bits_per_element}",
                msg.bits_per_element
            )));
        }
        if msg.sender_element_count > self.remote_count_bound {
            return Err(ReconError::protocol(format!(
                "bloom filter covers {} elements, peer has at most {}",
                msg.sender_element_count, self.remote_count_bound
            )));
        }
        let count = usize::try_from(msg.sender_element_count).unwrap_or(usize::MAX);
        let expected = filter_size_bytes(count, msg.bits_per_element);
        if msg.total_len as usize != expected {
            return Err(ReconError::protocol(format!(
                "bloom filter is {} bytes, expected {expected} for {} elements",
                msg.total_len, msg.sender_element_count
            )));
        }
        Ok(())
    }

    /// Accumulates a chunk; returns the filter once complete.
    fn collect_chunk(&mut self, msg: BloomFilterMessage) -> ReconResult<Option<PartialFilter>> {
        if msg.chunk.is_empty() {
            return Err(ReconError::protocol("empty bloom filter chunk"));
        }
        if let Some(partial) = &self.incoming {
            if partial.salt != msg.salt
                || partial.total_len != msg.total_len as usize
                || partial.bits_per_element != msg.bits_per_element
                || partial.sender_count != msg.sender_element_count
            {
                return Err(ReconError::protocol("inconsistent bloom filter chunk"));
            }
        }
        let partial = self.incoming.get_or_insert_with(|| PartialFilter {
            data: Vec::new(),
            total_len: msg.total_len as usize,
            bits_per_element: msg.bits_per_element,
            salt: msg.salt,
            sender_count: msg.sender_element_count,
            sender_xor: msg.element_xor_hash,
        });
        if partial.data.len() + msg.chunk.len() > partial.total_len {
            return Err(ReconError::protocol(format!(
                "bloom filter chunks exceed announced length {}",
                partial.total_len
            )));
        }
        partial.data.extend_from_slice(&msg.chunk);
        if partial.data.len() < partial.total_len {
            return Ok(None);
        }
        Ok(self.incoming.take())
    }

    fn handle_filter(&mut self, ctx: &mut OpContext<'_>, msg: BloomFilterMessage) -> ReconResult<()> {
        if !matches!(
            self.phase,
            IntersectionPhase::CountSent | IntersectionPhase::BfExchange
        ) {
            return Err(self.wrong_phase(&ReconMessage::BloomFilter(msg)));
        }
        self.check_filter_header(&msg, ctx.config.max_bloom_bits_per_element)?;
        let Some(received) = self.collect_chunk(msg)? else {
            return Ok(());
        };
        let filter = BloomFilter::from_bytes(received.data, received.bits_per_element)?;
        self.remote_count = received.sender_count;
        self.remote_count_bound = received.sender_count;
        self.remote_xor = received.sender_xor;

        if self.initialized {
            self.reduce(ctx, &filter, received.salt);
        } else {
            self.initialize_filtered(ctx, &filter, received.salt);
        }

        if self.my_elements.is_empty()
            || (self.my_count() == self.remote_count && self.my_xor == self.remote_xor)
        {
            self.send_done(ctx);
            Ok(())
        } else {
            self.send_filter(ctx)
        }
    }

    fn handle_done(&mut self, ctx: &mut OpContext<'_>, msg: IntersectionDoneMessage) -> ReconResult<()> {
        match self.phase {
            IntersectionPhase::CountSent | IntersectionPhase::BfExchange => {
                self.initialize(ctx);
                if msg.final_element_count == 0 {
                    self.remove_all(ctx);
                } else {
                    self.check_final(&msg)?;
                }
                ctx.send(ReconMessage::IntersectionDone(IntersectionDoneMessage {
                    final_element_count: self.my_count(),
                    element_xor_hash: self.my_xor,
                }));
                self.set_phase(IntersectionPhase::DoneReceived);
                Ok(())
            }
            IntersectionPhase::MustSendDone => {
                self.check_final(&msg)?;
                self.finish(ctx);
                Ok(())
            }
            _ => Err(self.wrong_phase(&ReconMessage::IntersectionDone(msg))),
        }
    }

    fn check_final(&self, msg: &IntersectionDoneMessage) -> ReconResult<()> {
        if msg.final_element_count != self.my_count() || msg.element_xor_hash != self.my_xor {
            return Err(ReconError::ResultMismatch(format!(
                "peer finished with {} elements, we have {}",
                msg.final_element_count,
                self.my_count()
            )));
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &mut OpContext<'_>) {
        self.set_phase(IntersectionPhase::Finished);
        if ctx.result_mode == ResultMode::Full {
            for element in self.my_elements.values() {
                ctx.report(element, ResultStatus::Added);
            }
        }
        info!(elements = self.my_count(), "intersection complete");
        ctx.complete();
    }
}

fn report_removed(ctx: &mut OpContext<'_>, element: &Element) {
    if matches!(ctx.result_mode, ResultMode::Removed | ResultMode::Symmetric) {
        ctx.report(element, ResultStatus::RemovedLocal);
    }
}

impl Reconciler for IntersectionOperation {
    fn evaluate(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        // The acceptor only sends the first filter when it has no more
        // elements than we announced.
        self.remote_count_bound = ctx.view.count();
        self.set_phase(IntersectionPhase::CountSent);
        Ok(())
    }

    fn accept(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        let my_count = ctx.view.count();
        if self.remote_count < my_count {
            ctx.send(ReconMessage::ElementInfo(ElementInfoMessage {
                sender_element_count: my_count,
            }));
            self.set_phase(IntersectionPhase::CountSent);
            return Ok(());
        }
        self.begin_exchange(ctx)
    }

    fn handle_message(&mut self, ctx: &mut OpContext<'_>, message: ReconMessage) -> ReconResult<()> {
        match message {
            ReconMessage::ElementInfo(msg) => self.handle_element_info(ctx, msg),
            ReconMessage::BloomFilter(msg) => self.handle_filter(ctx, msg),
            ReconMessage::IntersectionDone(msg) => self.handle_done(ctx, msg),
            other => Err(self.wrong_phase(&other)),
        }
    }

    fn channel_closed(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        if self.phase == IntersectionPhase::DoneReceived {
            self.finish(ctx);
            Ok(())
        } else {
            Err(ReconError::ChannelClosed)
        }
    }

    fn phase_name(&self) -> &'static str {
        self.phase.name()
    }
}
