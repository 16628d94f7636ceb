//! One frame thread: a worker, its private codec context, a one-packet
//! mailbox and the queue of frames produced from that packet.
//!
//! Locking: `SlotShared::inner` is held by the worker for the whole time it
//! decodes and by the scheduler while it hands over a packet. The progress
//! lock nests inside it and is never held while waiting for `inner`.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::accel::{AccelBinding, AccelState, AsyncLock};
use crate::buffer::BufferPool;
use crate::codec::{Codec, CodecContext, PacketSource};
use crate::decode::{self, UserFields};
use crate::error::{Error, Received, Result};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::stream::StreamParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Idle, accepts a packet.
    Ready,
    /// Decoding; the state the next thread copies is still changing.
    SettingUp,
    /// Still decoding, but the state for the next thread is final.
    StateFinalized,
}

/// How a thread's last decode call ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Ok,
    Eof,
    Failed(Error),
}

/// Snapshot taken when a thread finishes setup; what the next thread
/// copies forward.
pub(crate) struct Published<C: Codec> {
    pub params: StreamParams,
    pub forward: C::Forward,
    pub accel: Option<AccelState>,
    pub pool: Option<BufferPool>,
}

impl<C: Codec> Clone for Published<C> {
    fn clone(&self) -> Self {
        Self {
            params: self.params.clone(),
            forward: self.forward.clone(),
            accel: self.accel.clone(),
            pool: self.pool.clone(),
        }
    }
}

struct ProgressState<C: Codec> {
    state: SlotState,
    frames: VecDeque<Frame>,
    result: Outcome,
    published: Option<Published<C>>,
}

pub(crate) struct Progress<C: Codec> {
    index: usize,
    state: Mutex<ProgressState<C>>,
    /// Signalled on every state change.
    progress_cond: Condvar,
    /// Signalled when the thread is back to `Ready`.
    output_cond: Condvar,
    async_lock: Arc<AsyncLock>,
}

impl<C: Codec> Progress<C> {
    fn state(&self) -> SlotState {
        self.state.lock().state
    }

    pub(crate) fn finish_setup(&self, ctx: &mut CodecContext<C>) {
        ctx.accel.acquire();
        if !ctx.accel.is_async_safe() && !ctx.async_serializing {
            ctx.async_serializing = true;
            self.async_lock.lock();
        }

        let published = take_snapshot(ctx);
        let mut st = self.state.lock();
        if st.state == SlotState::StateFinalized {
            log::warn!("multiple finish_setup calls on frame thread {}", self.index);
        }
        st.state = SlotState::StateFinalized;
        st.published = Some(published);
        self.progress_cond.notify_all();
    }

    /// Finalizes without publishing anything, after setup blew up.
    fn abandon_setup(&self) {
        let mut st = self.state.lock();
        if st.state == SlotState::SettingUp {
            st.state = SlotState::StateFinalized;
            st.published = None;
            self.progress_cond.notify_all();
        }
    }

    fn wait_setup_done(&self) -> Option<Published<C>> {
        let mut st = self.state.lock();
        while st.state == SlotState::SettingUp {
            self.progress_cond.wait(&mut st);
        }
        st.published.clone()
    }

    fn wait_ready(&self) {
        let mut st = self.state.lock();
        while st.state != SlotState::Ready {
            self.output_cond.wait(&mut st);
        }
    }

    fn complete(&self, frames: Vec<Frame>, result: Outcome) {
        let mut st = self.state.lock();
        st.frames.extend(frames);
        st.result = result;
        st.state = SlotState::Ready;
        self.progress_cond.notify_all();
        self.output_cond.notify_all();
    }
}

struct SlotInner<C: Codec> {
    ctx: CodecContext<C>,
    mailbox: Packet,
    die: bool,
}

struct SlotShared<C: Codec> {
    inner: Mutex<SlotInner<C>>,
    input_cond: Condvar,
    progress: Arc<Progress<C>>,
}

pub(crate) struct Slot<C: Codec> {
    index: usize,
    shared: Arc<SlotShared<C>>,
    thread: Option<JoinHandle<()>>,
}

impl<C: Codec> Slot<C> {
    pub fn spawn(index: usize, mut ctx: CodecContext<C>, async_lock: Arc<AsyncLock>) -> Result<Self> {
        let progress = Arc::new(Progress {
            index,
            state: Mutex::new(ProgressState {
                state: SlotState::Ready,
                frames: VecDeque::new(),
                result: Outcome::Ok,
                published: None,
            }),
            progress_cond: Condvar::new(),
            output_cond: Condvar::new(),
            async_lock,
        });
        ctx.thread = Some(Arc::clone(&progress));
        let shared = Arc::new(SlotShared {
            inner: Mutex::new(SlotInner {
                ctx,
                mailbox: Packet::default(),
                die: false,
            }),
            input_cond: Condvar::new(),
            progress,
        });

        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("frame-thread-{}", index))
            .spawn(move || worker_loop(worker))
            .map_err(|e| {
                Error::ResourceExhausted(format!("failed to spawn frame thread {}: {}", index, e))
            })?;

        Ok(Self {
            index,
            shared,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> SlotState {
        self.shared.progress.state()
    }

    /// Hands `pkt` to the worker. An empty packet starts draining. Before the
    /// hand-over the state published by `prev` is copied in, waiting for
    /// `prev` to finish setup first.
    pub fn submit(&self, pkt: Packet, user: &UserFields, prev: Option<&Slot<C>>) -> Result<()> {
        // the worker holds `inner` while decoding, so check before locking
        self.ensure_ready()?;
        let mut inner = self.shared.inner.lock();
        self.ensure_ready()?;
        if pkt.is_empty() {
            inner.ctx.internal.draining = true;
        }
        inner.mailbox = pkt;
        inner.ctx.user = user.clone();

        if let Some(prev) = prev {
            let published = prev.shared.progress.wait_setup_done();
            // codecs without delay return eof from here on anyway
            let delay = inner.ctx.caps().delay;
            if !inner.ctx.internal.draining || delay {
                if let Some(published) = published {
                    update_context_from_thread(&mut inner.ctx, &published)?;
                }
            }
        }

        self.shared.progress.state.lock().state = SlotState::SettingUp;
        self.shared.input_cond.notify_one();
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state() != SlotState::Ready {
            return Err(Error::ContractViolation(format!(
                "packet submitted to busy frame thread {}",
                self.index
            )));
        }
        Ok(())
    }

    pub fn wait_ready(&self) {
        self.shared.progress.wait_ready();
    }

    /// Takes the frames and result of the last decode. Only meaningful once
    /// the thread is `Ready`.
    pub fn collect(&self) -> (VecDeque<Frame>, Outcome) {
        let mut st = self.shared.progress.state.lock();
        let frames = std::mem::take(&mut st.frames);
        let result = std::mem::replace(&mut st.result, Outcome::Ok);
        (frames, result)
    }

    /// Snapshot of the context as it is now, not as it was at finalize.
    pub fn snapshot(&self) -> Published<C> {
        self.with_ctx(|ctx| take_snapshot(ctx))
    }

    /// Runs `f` on the codec context. Blocks while the worker is decoding.
    pub fn with_ctx<R>(&self, f: impl FnOnce(&mut CodecContext<C>) -> R) -> R {
        let mut inner = self.shared.inner.lock();
        f(&mut inner.ctx)
    }

    /// Drops queued output and decode progress, then flushes the codec.
    pub fn reset(&self) {
        {
            let mut st = self.shared.progress.state.lock();
            st.frames.clear();
            st.result = Outcome::Ok;
        }
        let mut inner = self.shared.inner.lock();
        inner.mailbox = Packet::default();
        let ctx = &mut inner.ctx;
        ctx.internal.reset();
        let codec = Arc::clone(ctx.codec());
        codec.flush(ctx);
    }

    /// Wakes the idle worker with `die` set and joins it.
    pub fn stop(&mut self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            inner.die = true;
            self.shared.input_cond.notify_one();
        }
        if let Some(handle) = self.thread.take() {
            handle.join().map_err(|payload| {
                Error::Join(format!(
                    "frame thread {} panicked: {}",
                    self.index,
                    panic_message(payload.as_ref())
                ))
            })?;
        }
        Ok(())
    }
}

fn take_snapshot<C: Codec>(ctx: &CodecContext<C>) -> Published<C> {
    Published {
        params: ctx.params.clone(),
        forward: ctx.codec().export_forward(&ctx.priv_data),
        accel: ctx.accel.forward(),
        pool: ctx.pool.clone(),
    }
}

/// Copies the causally relevant state of an earlier thread into `dst`.
pub(crate) fn update_context_from_thread<C: Codec>(
    dst: &mut CodecContext<C>,
    src: &Published<C>,
) -> Result<()> {
    let codec = Arc::clone(dst.codec());
    if codec.caps().update_thread_context {
        dst.params.copy_forward(&src.params);
        if src.pool.is_some() {
            dst.pool = src.pool.clone();
        }
        codec.update_thread_context(dst, &src.forward)?;
    }
    if let Some(accel) = &src.accel {
        dst.accel = AccelBinding::Private(accel.clone());
    }
    Ok(())
}

struct Mailbox<'a>(&'a mut Packet);

impl PacketSource for Mailbox<'_> {
    fn get_packet(&mut self) -> Result<Received<Packet>> {
        if self.0.is_empty() {
            Ok(Received::NeedInput)
        } else {
            Ok(Received::Unit(self.0.move_ref()))
        }
    }
}

fn worker_loop<C: Codec>(shared: Arc<SlotShared<C>>) {
    let progress = Arc::clone(&shared.progress);
    log::debug!("frame thread {} started", progress.index);

    let mut inner = shared.inner.lock();
    loop {
        while progress.state() == SlotState::Ready && !inner.die {
            shared.input_cond.wait(&mut inner);
        }
        if inner.die {
            break;
        }

        let SlotInner { ctx, mailbox, .. } = &mut *inner;
        let step = panic::catch_unwind(AssertUnwindSafe(|| {
            if !ctx.caps().update_thread_context {
                progress.finish_setup(ctx);
            }
            // a thread-unsafe accelerator stays locked for the whole decode
            ctx.accel.acquire();

            let decoded = decode_packet(ctx, mailbox);

            if progress.state() == SlotState::SettingUp {
                progress.finish_setup(ctx);
            }
            decoded
        }));
        let (frames, result) = match step {
            Ok(decoded) => decoded,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log::error!(
                    "codec {} panicked on frame thread {}: {}",
                    ctx.codec().name(),
                    progress.index,
                    msg
                );
                // nothing to publish, the next thread keeps its own state
                progress.abandon_setup();
                (
                    Vec::new(),
                    Outcome::Failed(Error::InvariantBroken(format!("frame thread panicked: {}", msg))),
                )
            }
        };
        ctx.accel.release();
        if ctx.async_serializing {
            ctx.async_serializing = false;
            progress.async_lock.unlock();
        }
        progress.complete(frames, result);
    }

    log::debug!("frame thread {} exiting", progress.index);
}

/// Pulls frames out of the context until it wants another packet.
fn decode_packet<C: Codec>(ctx: &mut CodecContext<C>, mailbox: &mut Packet) -> (Vec<Frame>, Outcome) {
    let mut frames = Vec::new();
    let mut source = Mailbox(mailbox);
    loop {
        let step = panic::catch_unwind(AssertUnwindSafe(|| {
            decode::receive_frame_internal(ctx, &mut source)
        }));
        match step {
            Ok(Ok(Received::Unit(frame))) => frames.push(frame),
            Ok(Ok(Received::NeedInput)) => return (frames, Outcome::Ok),
            Ok(Ok(Received::Eof)) => return (frames, Outcome::Eof),
            Ok(Err(e)) => return (frames, Outcome::Failed(e)),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log::error!("codec {} panicked while decoding: {}", ctx.codec().name(), msg);
                return (
                    frames,
                    Outcome::Failed(Error::InvariantBroken(format!("decode panicked: {}", msg))),
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
