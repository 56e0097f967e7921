//! Union reconciliation.
//!
//! The responder compares strata estimators to guess the size of the
//! symmetric difference. Small differences are resolved with an IBF sized
//! for the guess: the decoding side offers what only it has and inquires
//! about what only the peer has; each side then demands the elements it is
//! missing. Large differences, empty sets and `force_full` fall back to
//! shipping the whole set.
//!
//! ```text
//! initiator                               responder
//!   OPERATION_REQUEST, STRATA_ESTIMATOR ->
//!                                        <- IBF*            (or full set)
//!   OFFER*, INQUIRY*, DONE              ->
//!                                        <- OFFER*, DEMAND*
//!   DEMAND*, ELEMENTS*                  ->
//!                                        <- ELEMENTS*, DONE
//!   close
//! ```

use crate::error::{ReconError, ReconResult};
use crate::operation::{OpContext, Reconciler, ResultMode, ResultStatus};
use crate::protocol::{
    IbfMessage, InquiryMessage, ReconMessage, StrataMessage, MAX_BUCKETS_PER_MESSAGE,
    MAX_HASHES_PER_MESSAGE, MAX_KEYS_PER_INQUIRY,
};
use setrecon_sketch::{
    derive_ibf_key, EncodedStrata, IbfKey, InvertibleBloomFilter, Side, SketchError,
    StrataEstimator, IBF_BUCKET_SIZE, SE_IBF_HASH_NUM,
};
use setrecon_types::{Element, ElementHash};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Phases of a union operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionPhase {
    /// Responder waiting for the initiator's strata estimator.
    ExpectSe,
    /// Initiator waiting for the first IBF (or a full set).
    ExpectIbf,
    /// Receiving further slices of an IBF.
    ExpectIbfCont,
    /// We decoded an IBF and drive the inventory exchange.
    InventoryActive,
    /// The peer is decoding the IBF we sent.
    InventoryPassive,
    /// Passive side got DONE; waiting for our demands before replying DONE.
    FinishWaiting,
    /// Active side got DONE; waiting for our demands before closing.
    FinishClosing,
    /// Finished on our side; waiting for the channel to close.
    Done,
    /// We sent our full set and wait for the peer's missing elements.
    FullSending,
    /// We asked for the peer's full set.
    FullReceiving,
}

impl UnionPhase {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ExpectSe => "expect_se",
            Self::ExpectIbf => "expect_ibf",
            Self::ExpectIbfCont => "expect_ibf_cont",
            Self::InventoryActive => "inventory_active",
            Self::InventoryPassive => "inventory_passive",
            Self::FinishWaiting => "finish_waiting",
            Self::FinishClosing => "finish_closing",
            Self::Done => "done",
            Self::FullSending => "full_sending",
            Self::FullReceiving => "full_receiving",
        }
    }
}

/// A local element registered under its IBF key.
#[derive(Debug, Clone)]
struct KeyEntry {
    key: IbfKey,
    hash: ElementHash,
    /// The peer is known to have this element.
    received: bool,
}

#[derive(Debug)]
pub struct UnionOperation {
    phase: UnionPhase,
    /// Snapshot of the set's estimator when the operation was bound.
    se: StrataEstimator,
    initial_size: u64,
    remote_size: u64,
    /// Local elements by the low 32 bits of their unsalted key.
    key_to_element: HashMap<u32, Vec<KeyEntry>>,
    /// Elements received from the peer that we did not have.
    received: HashMap<ElementHash, Element>,
    /// Demands sent and not yet answered.
    demanded: HashSet<ElementHash>,
    salt_send: u32,
    salt_receive: u32,
    remote_ibf: Option<InvertibleBloomFilter>,
    remote_ibf_order: u8,
    ibf_buckets_received: usize,
    received_total: u64,
    received_fresh: u64,
}

impl UnionOperation {
    pub(crate) fn new(se: StrataEstimator) -> Self {
        Self {
            phase: UnionPhase::ExpectSe,
            se,
            initial_size: 0,
            remote_size: 0,
            key_to_element: HashMap::new(),
            received: HashMap::new(),
            demanded: HashSet::new(),
            salt_send: 0,
            salt_receive: 0,
            remote_ibf: None,
            remote_ibf_order: 0,
            ibf_buckets_received: 0,
            received_total: 0,
            received_fresh: 0,
        }
    }

    #[must_use]
    pub fn phase(&self) -> UnionPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: UnionPhase) {
        debug!(from = self.phase.name(), to = phase.name(), "union phase");
        self.phase = phase;
    }

    fn wrong_phase(&self, message: &ReconMessage) -> ReconError {
        ReconError::WrongPhase {
            message: message.kind(),
            phase: self.phase.name(),
        }
    }

    fn initialize(&mut self, ctx: &OpContext<'_>) {
        self.key_to_element.clear();
        let mut size = 0u64;
        for (hash, _) in ctx.view.iter() {
            let key = derive_ibf_key(hash);
            self.key_to_element
                .entry(key.low32())
                .or_default()
                .push(KeyEntry {
                    key,
                    hash: *hash,
                    received: false,
                });
            size += 1;
        }
        self.initial_size = size;
    }

    fn hashes_for_key(&self, key: IbfKey) -> impl Iterator<Item = ElementHash> + '_ {
        self.key_to_element
            .get(&key.low32())
            .into_iter()
            .flatten()
            .filter(move |e| e.key == key)
            .map(|e| e.hash)
    }

    fn mark_received(&mut self, hash: &ElementHash) {
        let key = derive_ibf_key(hash);
        if let Some(entries) = self.key_to_element.get_mut(&key.low32()) {
            for entry in entries.iter_mut().filter(|e| e.hash == *hash) {
                entry.received = true;
            }
        }
    }

    fn build_local_ibf(&self, size: usize, salt: u32) -> ReconResult<InvertibleBloomFilter> {
        let mut ibf = InvertibleBloomFilter::new(size, SE_IBF_HASH_NUM)?;
        for entry in self.key_to_element.values().flatten() {
            ibf.insert(entry.key.salted(salt));
        }
        Ok(ibf)
    }

    fn send_strata(&self, ctx: &mut OpContext<'_>) {
        let encoded = self.se.encode();
        let msg = StrataMessage {
            set_size: self.initial_size,
            data: encoded.bytes,
        };
        ctx.send(if encoded.compressed {
            ReconMessage::StrataEstimatorCompressed(msg)
        } else {
            ReconMessage::StrataEstimator(msg)
        });
    }

    fn send_ibf(&mut self, ctx: &mut OpContext<'_>, order: u8) -> ReconResult<()> {
        let size = 1usize << order;
        let ibf = self.build_local_ibf(size, self.salt_send)?;
        debug!(order, salt = self.salt_send, "sending ibf");
        let mut offset = 0;
        while offset < size {
            let count = (size - offset).min(MAX_BUCKETS_PER_MESSAGE);
            let mut buckets = Vec::with_capacity(count * IBF_BUCKET_SIZE);
            ibf.write_slice(offset, count, &mut buckets)?;
            ctx.send(ReconMessage::Ibf(IbfMessage {
                order,
                offset: offset as u32,
                salt: self.salt_send,
                buckets,
            }));
            offset += count;
        }
        self.set_phase(UnionPhase::InventoryPassive);
        Ok(())
    }

    fn send_full_set(&mut self, ctx: &mut OpContext<'_>) {
        info!(elements = self.initial_size, "sending full set");
        self.set_phase(UnionPhase::FullSending);
        for (_, element) in ctx.view.iter() {
            ctx.send(ReconMessage::FullElement(element.clone()));
        }
        ctx.send(ReconMessage::FullDone);
    }

    fn handle_strata(
        &mut self,
        ctx: &mut OpContext<'_>,
        msg: StrataMessage,
        compressed: bool,
    ) -> ReconResult<()> {
        let remote = StrataEstimator::decode(&EncodedStrata {
            compressed,
            bytes: msg.data,
        })?;
        self.remote_size = msg.set_size;

        if ctx.options.byzantine && self.remote_size < ctx.options.byzantine_lower_bound {
            return Err(ReconError::Byzantine(format!(
                "peer announced {} elements, lower bound is {}",
                self.remote_size, ctx.options.byzantine_lower_bound
            )));
        }

        let diff = ctx.config.inflate_estimate(self.se.difference(&remote)?);
        debug!(
            diff,
            local = self.initial_size,
            remote = self.remote_size,
            "strata estimate"
        );

        let too_large = !ctx.options.force_delta
            && diff > self.initial_size / ctx.config.full_fallback_divisor;
        let full = diff == 0
            || self.initial_size == 0
            || self.remote_size == 0
            || ctx.options.force_full
            || too_large;

        if !full {
            let order = ctx.config.ibf_order_for(diff);
            return self.send_ibf(ctx, order);
        }
        if self.initial_size <= self.remote_size || self.remote_size == 0 {
            info!(diff, "requesting full set from peer");
            ctx.send(ReconMessage::RequestFull);
            self.set_phase(UnionPhase::FullReceiving);
        } else {
            self.send_full_set(ctx);
        }
        Ok(())
    }

    fn handle_ibf(&mut self, ctx: &mut OpContext<'_>, msg: IbfMessage) -> ReconResult<()> {
        match self.phase {
            UnionPhase::ExpectIbf | UnionPhase::InventoryPassive => {
                if msg.order > ctx.config.max_ibf_order {
                    return Err(ReconError::ResourceLimit(format!(
                        "ibf order {} exceeds maximum {}",
                        msg.order, ctx.config.max_ibf_order
                    )));
                }
                if msg.offset != 0 {
                    return Err(ReconError::protocol(format!(
                        "first ibf slice starts at offset {}",
                        msg.offset
                    )));
                }
                self.remote_ibf = Some(InvertibleBloomFilter::new(1usize << msg.order, SE_IBF_HASH_NUM)?);
                self.remote_ibf_order = msg.order;
                self.salt_receive = msg.salt;
                self.ibf_buckets_received = 0;
                self.set_phase(UnionPhase::ExpectIbfCont);
            }
            UnionPhase::ExpectIbfCont => {
                if msg.offset as usize != self.ibf_buckets_received
                    || msg.order != self.remote_ibf_order
                    || msg.salt != self.salt_receive
                {
                    return Err(ReconError::protocol(format!(
                        "inconsistent ibf slice (order {}, offset {}, salt {}) after {} buckets",
                        msg.order, msg.offset, msg.salt, self.ibf_buckets_received
                    )));
                }
            }
            _ => return Err(self.wrong_phase(&ReconMessage::Ibf(msg))),
        }

        let Some(ibf) = self.remote_ibf.as_mut() else {
            return Err(ReconError::protocol("ibf slice without an ibf"));
        };
        let read = ibf.read_slice(&msg.buckets, self.ibf_buckets_received)?;
        if read == 0 {
            return Err(ReconError::protocol("empty ibf slice"));
        }
        self.ibf_buckets_received += read;
        if self.ibf_buckets_received == ibf.size() {
            self.set_phase(UnionPhase::InventoryActive);
            self.decode_and_send(ctx)?;
        }
        Ok(())
    }

    /// Decodes the received IBF against our own. On success sends offers,
    /// inquiries and DONE; on failure retries with a bigger IBF.
    fn decode_and_send(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        let Some(remote) = self.remote_ibf.take() else {
            return Err(ReconError::protocol("no ibf to decode"));
        };
        let mut diff = self.build_local_ibf(remote.size(), self.salt_receive)?;
        diff.subtract(&remote)?;

        match diff.decode_all() {
            Ok(keys) => {
                let mut offers = Vec::new();
                let mut inquiries = Vec::new();
                for (side, key) in keys {
                    let key = key.unsalted(self.salt_receive);
                    match side {
                        Side::Local => offers.extend(self.hashes_for_key(key)),
                        Side::Remote => inquiries.push(key),
                    }
                }
                debug!(
                    offers = offers.len(),
                    inquiries = inquiries.len(),
                    "ibf decoded"
                );
                for chunk in offers.chunks(MAX_HASHES_PER_MESSAGE) {
                    ctx.send(ReconMessage::Offer(chunk.to_vec()));
                }
                for chunk in inquiries.chunks(MAX_KEYS_PER_INQUIRY) {
                    ctx.send(ReconMessage::Inquiry(InquiryMessage {
                        salt: self.salt_receive,
                        keys: chunk.to_vec(),
                    }));
                }
                ctx.send(ReconMessage::Done);
                Ok(())
            }
            Err(SketchError::DecodeFailed { decoded }) => {
                let next = self.remote_ibf_order + 1;
                if next > ctx.config.max_ibf_order {
                    return Err(ReconError::ResourceLimit(format!(
                        "ibf decoding failed at maximum order {}",
                        self.remote_ibf_order
                    )));
                }
                warn!(
                    order = self.remote_ibf_order,
                    decoded, "ibf decoding failed, retrying with order {next}"
                );
                self.salt_send = self.salt_send.wrapping_add(1);
                self.send_ibf(ctx, next)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn handle_offer(&mut self, ctx: &mut OpContext<'_>, hashes: Vec<ElementHash>) -> ReconResult<()> {
        if !matches!(
            self.phase,
            UnionPhase::InventoryActive | UnionPhase::InventoryPassive
        ) {
            return Err(self.wrong_phase(&ReconMessage::Offer(hashes)));
        }
        let mut demands = Vec::new();
        for hash in hashes {
            if ctx.view.contains(&hash)
                || self.received.contains_key(&hash)
                || !self.demanded.insert(hash)
            {
                continue;
            }
            demands.push(hash);
        }
        for chunk in demands.chunks(MAX_HASHES_PER_MESSAGE) {
            ctx.send(ReconMessage::Demand(chunk.to_vec()));
        }
        Ok(())
    }

    fn handle_inquiry(&mut self, ctx: &mut OpContext<'_>, msg: InquiryMessage) -> ReconResult<()> {
        if self.phase != UnionPhase::InventoryPassive {
            return Err(self.wrong_phase(&ReconMessage::Inquiry(msg)));
        }
        if msg.salt != self.salt_send {
            return Err(ReconError::protocol(format!(
                "inquiry for salt {} but our ibf used {}",
                msg.salt, self.salt_send
            )));
        }
        let offers: Vec<ElementHash> = msg
            .keys
            .iter()
            .flat_map(|key| self.hashes_for_key(*key))
            .collect();
        for chunk in offers.chunks(MAX_HASHES_PER_MESSAGE) {
            ctx.send(ReconMessage::Offer(chunk.to_vec()));
        }
        Ok(())
    }

    fn handle_demand(&mut self, ctx: &mut OpContext<'_>, hashes: Vec<ElementHash>) -> ReconResult<()> {
        if !matches!(
            self.phase,
            UnionPhase::InventoryActive
                | UnionPhase::InventoryPassive
                | UnionPhase::FinishWaiting
                | UnionPhase::FinishClosing
                | UnionPhase::Done
        ) {
            return Err(self.wrong_phase(&ReconMessage::Demand(hashes)));
        }
        for hash in hashes {
            let Some(element) = ctx.view.get(&hash) else {
                return Err(ReconError::UnknownElement(hash));
            };
            ctx.send(ReconMessage::Elements(element.clone()));
            if ctx.result_mode == ResultMode::Symmetric {
                ctx.report(element, ResultStatus::AddedRemote);
            }
        }
        Ok(())
    }

    fn handle_element(&mut self, ctx: &mut OpContext<'_>, element: Element) -> ReconResult<()> {
        if !matches!(
            self.phase,
            UnionPhase::InventoryActive
                | UnionPhase::InventoryPassive
                | UnionPhase::FinishWaiting
                | UnionPhase::FinishClosing
        ) {
            return Err(self.wrong_phase(&ReconMessage::Elements(element)));
        }
        element.validate()?;
        let hash = element.hash();
        if !self.demanded.remove(&hash) {
            return Err(ReconError::UnrequestedElement(hash));
        }
        self.accept_element(ctx, element, hash)?;
        self.maybe_finish(ctx);
        Ok(())
    }

    fn handle_full_element(&mut self, ctx: &mut OpContext<'_>, element: Element) -> ReconResult<()> {
        match self.phase {
            UnionPhase::ExpectIbf => self.set_phase(UnionPhase::FullReceiving),
            UnionPhase::FullReceiving | UnionPhase::FullSending => {}
            _ => return Err(self.wrong_phase(&ReconMessage::FullElement(element))),
        }
        element.validate()?;
        let hash = element.hash();
        self.accept_element(ctx, element, hash)
    }

    /// Records an element from the peer, reporting it if it is new to us.
    fn accept_element(
        &mut self,
        ctx: &mut OpContext<'_>,
        element: Element,
        hash: ElementHash,
    ) -> ReconResult<()> {
        self.received_total += 1;
        if ctx.view.contains(&hash) {
            self.mark_received(&hash);
        } else if !self.received.contains_key(&hash) {
            self.received_fresh += 1;
            if matches!(ctx.result_mode, ResultMode::Added | ResultMode::Symmetric) {
                ctx.report(&element, ResultStatus::Added);
            }
            self.received.insert(hash, element);
        }

        if ctx.options.byzantine
            && ctx
                .config
                .looks_byzantine(self.received_total, self.received_fresh)
        {
            return Err(ReconError::Byzantine(format!(
                "{} of {} received elements were already known",
                self.received_total - self.received_fresh,
                self.received_total
            )));
        }
        Ok(())
    }

    fn handle_full_done(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        match self.phase {
            UnionPhase::FullReceiving | UnionPhase::ExpectIbf => {
                let mut sent = 0usize;
                for (hash, element) in ctx.view.iter() {
                    if self.peer_has(hash) {
                        continue;
                    }
                    ctx.send(ReconMessage::FullElement(element.clone()));
                    if ctx.result_mode == ResultMode::Symmetric {
                        ctx.report(element, ResultStatus::AddedRemote);
                    }
                    sent += 1;
                }
                debug!(sent, "sent elements missing at peer");
                ctx.send(ReconMessage::FullDone);
                self.set_phase(UnionPhase::Done);
                Ok(())
            }
            UnionPhase::FullSending => {
                self.set_phase(UnionPhase::Done);
                self.finish(ctx);
                Ok(())
            }
            _ => Err(self.wrong_phase(&ReconMessage::FullDone)),
        }
    }

    fn peer_has(&self, hash: &ElementHash) -> bool {
        let key = derive_ibf_key(hash);
        self.key_to_element
            .get(&key.low32())
            .is_some_and(|entries| entries.iter().any(|e| e.hash == *hash && e.received))
    }

    fn handle_done(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        match self.phase {
            UnionPhase::InventoryPassive => {
                self.set_phase(UnionPhase::FinishWaiting);
                self.maybe_finish(ctx);
                Ok(())
            }
            UnionPhase::InventoryActive => {
                self.set_phase(UnionPhase::FinishClosing);
                self.maybe_finish(ctx);
                Ok(())
            }
            _ => Err(self.wrong_phase(&ReconMessage::Done)),
        }
    }

    fn maybe_finish(&mut self, ctx: &mut OpContext<'_>) {
        if !self.demanded.is_empty() {
            return;
        }
        match self.phase {
            UnionPhase::FinishWaiting => {
                ctx.send(ReconMessage::Done);
                self.set_phase(UnionPhase::Done);
            }
            UnionPhase::FinishClosing => {
                self.set_phase(UnionPhase::Done);
                self.finish(ctx);
            }
            _ => {}
        }
    }

    fn finish(&mut self, ctx: &mut OpContext<'_>) {
        if ctx.result_mode == ResultMode::Full {
            for (_, element) in ctx.view.iter() {
                ctx.report(element, ResultStatus::Added);
            }
            for element in self.received.values() {
                ctx.report(element, ResultStatus::Added);
            }
        }
        info!(
            received = self.received.len(),
            local = self.initial_size,
            "union complete"
        );
        ctx.complete();
    }
}

impl Reconciler for UnionOperation {
    fn evaluate(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        self.initialize(ctx);
        self.send_strata(ctx);
        self.set_phase(UnionPhase::ExpectIbf);
        Ok(())
    }

    fn accept(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        self.initialize(ctx);
        self.set_phase(UnionPhase::ExpectSe);
        Ok(())
    }

    fn handle_message(&mut self, ctx: &mut OpContext<'_>, message: ReconMessage) -> ReconResult<()> {
        match message {
            ReconMessage::StrataEstimator(msg) | ReconMessage::StrataEstimatorCompressed(msg)
                if self.phase != UnionPhase::ExpectSe =>
            {
                Err(ReconError::WrongPhase {
                    message: ReconMessage::StrataEstimator(msg).kind(),
                    phase: self.phase.name(),
                })
            }
            ReconMessage::StrataEstimator(msg) => self.handle_strata(ctx, msg, false),
            ReconMessage::StrataEstimatorCompressed(msg) => self.handle_strata(ctx, msg, true),
            ReconMessage::Ibf(msg) => self.handle_ibf(ctx, msg),
            ReconMessage::Offer(hashes) => self.handle_offer(ctx, hashes),
            ReconMessage::Inquiry(msg) => self.handle_inquiry(ctx, msg),
            ReconMessage::Demand(hashes) => self.handle_demand(ctx, hashes),
            ReconMessage::Elements(element) => self.handle_element(ctx, element),
            ReconMessage::FullElement(element) => self.handle_full_element(ctx, element),
            ReconMessage::Done => self.handle_done(ctx),
            ReconMessage::RequestFull => {
                if self.phase != UnionPhase::ExpectIbf {
                    return Err(self.wrong_phase(&ReconMessage::RequestFull));
                }
                self.send_full_set(ctx);
                Ok(())
            }
            ReconMessage::FullDone => self.handle_full_done(ctx),
            other => Err(self.wrong_phase(&other)),
        }
    }

    fn channel_closed(&mut self, ctx: &mut OpContext<'_>) -> ReconResult<()> {
        if self.phase == UnionPhase::Done {
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
