//! Frame threading: packets are handed round-robin to a ring of worker
//! threads and frames are collected from the same ring in the same order, so
//! output order equals submission order no matter which thread finishes
//! first.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::accel::{AccelBinding, AccelDescriptor, AccelState, AsyncLock};
use crate::codec::{Codec, CodecContext, PacketSource};
use crate::decode::UserFields;
use crate::error::{Error, Received, Result};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::slot::{Outcome, Slot, SlotState, update_context_from_thread};
use crate::stream::StreamParams;

pub struct FrameThreads<C: Codec> {
    codec: Arc<C>,
    slots: Vec<Slot<C>>,
    /// Next thread to hand a packet to.
    next_decoding: usize,
    /// Next thread to collect frames from.
    next_finished: usize,
    /// Thread that received the most recent packet.
    prev: Option<usize>,
    /// Frames collected from a thread but not yet returned.
    df: VecDeque<Frame>,
    result: Outcome,
    async_lock: Arc<AsyncLock>,
    /// Shared instance of a thread-unsafe accelerator.
    accel: Option<Arc<Mutex<AccelState>>>,
    params: StreamParams,
    pub(crate) user: UserFields,
    draining: bool,
    closed: bool,
}

impl<C: Codec> FrameThreads<C> {
    /// Starts `thread_count` workers, each with a context forked from
    /// `canonical`.
    pub fn new(
        codec: Arc<C>,
        params: &StreamParams,
        canonical: &C::Context,
        thread_count: usize,
        accel: Option<&AccelDescriptor>,
    ) -> Result<Self> {
        if thread_count < 2 {
            return Err(Error::InvalidArgument(format!(
                "frame threading needs at least 2 threads, got {}",
                thread_count
            )));
        }

        let async_lock = Arc::new(AsyncLock::new(true));
        let shared_accel = accel
            .filter(|desc| !desc.thread_safe)
            .map(|desc| Arc::new(Mutex::new(AccelState::new(desc.clone()))));
        let private_accel = accel
            .filter(|desc| desc.thread_safe)
            .map(|desc| AccelState::new(desc.clone()));

        let mut this = Self {
            codec: Arc::clone(&codec),
            slots: Vec::with_capacity(thread_count),
            next_decoding: 0,
            next_finished: 0,
            prev: None,
            df: VecDeque::new(),
            result: Outcome::Ok,
            async_lock: Arc::clone(&async_lock),
            accel: shared_accel.clone(),
            params: params.clone(),
            user: UserFields::default(),
            draining: false,
            closed: false,
        };

        // on error `this` is dropped, which stops the workers started so far
        for i in 0..thread_count {
            let priv_data = codec.fork(canonical)?;
            let binding = match (&shared_accel, &private_accel) {
                (Some(shared), _) => AccelBinding::shared(shared),
                (None, Some(state)) => AccelBinding::Private(state.fork()),
                (None, None) => AccelBinding::None,
            };
            let mut ctx = CodecContext::new(Arc::clone(&codec), priv_data, params.clone()).with_accel(binding);
            if i == 0 {
                this.params.copy_forward(&ctx.params);
                codec.update_thread_context_for_user(&mut this.params, &ctx)?;
            } else {
                ctx = ctx.as_copy();
            }
            this.slots.push(Slot::spawn(i, ctx, Arc::clone(&async_lock))?);
        }

        log::info!(
            "{}: frame threading with {} threads{}",
            codec.name(),
            thread_count,
            accel.map(|d| format!(", accelerator {}", d.name)).unwrap_or_default()
        );
        Ok(this)
    }

    pub fn thread_count(&self) -> usize {
        self.slots.len()
    }

    /// Stream parameters as of the last collected thread.
    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(|s| s.state()).collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Pulls packets from `src` and submits them until a frame comes back,
    /// `src` runs dry, or the stream ends. A thread that produced frames and
    /// an error hands out the frames first.
    pub fn receive_frame(&mut self, src: &mut dyn PacketSource) -> Result<Received<Frame>> {
        if self.closed {
            return Err(Error::ContractViolation("frame threads already torn down".to_string()));
        }
        self.async_lock.unlock();
        let received = self.receive_frame_unlocked(src);
        self.async_lock.lock();
        received
    }

    fn receive_frame_unlocked(&mut self, src: &mut dyn PacketSource) -> Result<Received<Frame>> {
        while self.df.is_empty() && matches!(self.result, Outcome::Ok) {
            let pkt = match self.next_packet(src)? {
                Some(pkt) => pkt,
                None => return Ok(Received::NeedInput),
            };
            self.submit(pkt)?;

            // no output until every thread has work
            if self.next_decoding != self.next_finished && !self.draining {
                continue;
            }
            self.collect()?;
        }

        if let Some(frame) = self.df.pop_front() {
            return Ok(Received::Unit(frame));
        }
        match std::mem::replace(&mut self.result, Outcome::Ok) {
            Outcome::Eof => Ok(Received::Eof),
            Outcome::Failed(e) => Err(e),
            Outcome::Ok => Err(Error::InvariantBroken(
                "collection ended without frames or a result".to_string(),
            )),
        }
    }

    /// `None` when the source needs more input. Once the source reported
    /// end of stream every call yields a drain packet.
    fn next_packet(&mut self, src: &mut dyn PacketSource) -> Result<Option<Packet>> {
        if self.draining {
            return Ok(Some(Packet::default()));
        }
        match src.get_packet()? {
            Received::Unit(pkt) => {
                self.user.last_pkt_props.copy_props(&pkt);
                Ok(Some(pkt))
            }
            Received::NeedInput => Ok(None),
            Received::Eof => {
                log::debug!("{}: draining frame threads", self.codec.name());
                self.draining = true;
                Ok(Some(Packet::default()))
            }
        }
    }

    fn submit(&mut self, pkt: Packet) -> Result<()> {
        let idx = self.next_decoding;
        let prev = self.prev.map(|p| &self.slots[p]);
        self.slots[idx].submit(pkt, &self.user, prev)?;
        self.prev = Some(idx);
        self.next_decoding = (idx + 1) % self.slots.len();
        Ok(())
    }

    fn collect(&mut self) -> Result<()> {
        let idx = self.next_finished;
        self.next_finished = (idx + 1) % self.slots.len();

        let slot = &self.slots[idx];
        slot.wait_ready();

        let codec = Arc::clone(&self.codec);
        let params = &mut self.params;
        let updated = slot.with_ctx(|ctx| {
            params.copy_forward(&ctx.params);
            codec.update_thread_context_for_user(params, ctx)
        });
        if let Err(e) = updated {
            log::warn!("{}: failed to update caller state from frame thread {}: {}", codec.name(), idx, e);
        }

        let (frames, result) = slot.collect();
        if !self.df.is_empty() {
            return Err(Error::InvariantBroken(format!(
                "collected frame thread {} with {} frames still queued",
                idx,
                self.df.len()
            )));
        }
        self.df = frames;
        self.result = result;
        Ok(())
    }

    /// Waits for every worker to go idle. The async lock is released while
    /// waiting so workers that need it can finish.
    fn park(&self) {
        self.async_lock.unlock();
        for slot in &self.slots {
            slot.wait_ready();
        }
        self.async_lock.lock();
    }

    /// Drops everything in flight and resets the ring. The most recent
    /// thread state is carried into the first thread so decoding resumes
    /// from it.
    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.park();

        if let Some(prev) = self.prev.filter(|&p| p != 0) {
            let published = self.slots[prev].snapshot();
            self.slots[0].with_ctx(|ctx| update_context_from_thread(ctx, &published))?;
        }

        self.next_decoding = 0;
        self.next_finished = 0;
        self.prev = None;
        self.df.clear();
        self.result = Outcome::Ok;
        self.draining = false;
        self.user.last_pkt_props = Packet::default();

        for slot in &self.slots {
            slot.reset();
        }
        log::debug!("{}: frame threads flushed", self.codec.name());
        Ok(())
    }

    /// Stops and joins every worker, closes the thread contexts and hands back
    /// the accelerator state. Idempotent.
    pub fn teardown(&mut self) -> Result<Option<AccelState>> {
        if self.closed {
            return Ok(None);
        }
        self.closed = true;
        self.park();

        let last = self.prev.unwrap_or(0);
        let mut stashed = self
            .slots
            .get(last)
            .and_then(|slot| slot.with_ctx(|ctx| ctx.accel.state_mut().cloned()));

        let mut first_err = None;
        for slot in &mut self.slots {
            if let Err(e) = slot.stop() {
                log::error!("{}", e);
                first_err.get_or_insert(e);
            }
        }
        for slot in &self.slots {
            slot.with_ctx(|ctx| {
                let codec = Arc::clone(ctx.codec());
                codec.close(ctx);
                ctx.accel.release();
            });
        }
        self.slots.clear();
        self.df.clear();

        if let Some(shared) = self.accel.take() {
            stashed = Some(match Arc::try_unwrap(shared) {
                Ok(state) => state.into_inner(),
                Err(shared) => shared.lock().clone(),
            });
        }
        log::debug!("{}: frame threads torn down", self.codec.name());

        match first_err {
            Some(e) => Err(e),
            None => Ok(stashed),
        }
    }
}

impl<C: Codec> Drop for FrameThreads<C> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("{}: frame thread teardown failed: {}", self.codec.name(), e);
        }
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
