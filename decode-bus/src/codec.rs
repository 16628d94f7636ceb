//! The contract a single-threaded decode algorithm implements to be driven
//! sequentially or from a pool of frame threads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::accel::{AccelBinding, AccelState};
use crate::buffer::BufferPool;
use crate::decode::{DecodeInternal, UserFields};
use crate::error::{Error, Received, Result};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::slot::Progress;
use crate::stream::StreamParams;

/// Calling convention of a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// [`Codec::decode`]: one packet in, at most one frame out.
    Decode,
    /// [`Codec::receive_frame`]: the codec pulls packets itself.
    ReceiveFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecCaps {
    pub kind: CodecKind,
    /// Output may lag input; the codec is called with empty packets while draining.
    pub delay: bool,
    /// Later threads need state from earlier ones through
    /// [`Codec::update_thread_context`].
    pub update_thread_context: bool,
    pub frame_threads: bool,
}

impl Default for CodecCaps {
    fn default() -> Self {
        Self {
            kind: CodecKind::Decode,
            delay: false,
            update_thread_context: false,
            frame_threads: true,
        }
    }
}

/// Frames the codec should not bother producing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discard {
    #[default]
    None,
    NonKey,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    /// Bytes of the packet used; less than its size leaves a remainder that is
    /// passed again on the next call.
    pub consumed: usize,
    pub got_frame: bool,
}

impl DecodeOutcome {
    pub fn frame(consumed: usize) -> Self {
        Self {
            consumed,
            got_frame: true,
        }
    }

    pub fn no_frame(consumed: usize) -> Self {
        Self {
            consumed,
            got_frame: false,
        }
    }
}

/// Where a codec context gets its next packet from.
pub trait PacketSource {
    fn get_packet(&mut self) -> Result<Received<Packet>>;
}

pub trait Codec: Send + Sync + Sized + 'static {
    /// Per-thread private state.
    type Context: Send + 'static;
    /// The part of the private state a later thread must see, captured when
    /// a thread finishes setup.
    type Forward: Clone + Send + 'static;

    fn name(&self) -> &'static str;

    fn caps(&self) -> CodecCaps {
        CodecCaps::default()
    }

    fn init(&self, params: &StreamParams) -> Result<Self::Context>;

    /// Copy of the canonical state for one worker thread.
    fn fork(&self, canonical: &Self::Context) -> Result<Self::Context>;

    fn export_forward(&self, ctx: &Self::Context) -> Self::Forward;

    fn update_thread_context(&self, _dst: &mut CodecContext<Self>, _src: &Self::Forward) -> Result<()> {
        Ok(())
    }

    /// Applied to the caller-facing parameters when output is collected from a thread.
    fn update_thread_context_for_user(
        &self,
        _user: &mut StreamParams,
        _src: &CodecContext<Self>,
    ) -> Result<()> {
        Ok(())
    }

    fn decode(&self, _ctx: &mut CodecContext<Self>, _pkt: &Packet, _frame: &mut Frame) -> Result<DecodeOutcome> {
        Err(Error::ContractViolation(format!(
            "{} does not implement decode",
            self.name()
        )))
    }

    fn receive_frame(
        &self,
        _ctx: &mut CodecContext<Self>,
        _src: &mut dyn PacketSource,
    ) -> Result<Received<Frame>> {
        Err(Error::ContractViolation(format!(
            "{} does not implement receive_frame",
            self.name()
        )))
    }

    fn flush(&self, _ctx: &mut CodecContext<Self>) {}

    fn close(&self, _ctx: &mut CodecContext<Self>) {}
}

/// A codec's private state plus everything the decode driver keeps next to it.
pub struct CodecContext<C: Codec> {
    codec: Arc<C>,
    pub priv_data: C::Context,
    pub params: StreamParams,
    pub user: UserFields,
    pub(crate) internal: DecodeInternal,
    pub(crate) accel: AccelBinding,
    pub(crate) thread: Option<Arc<Progress<C>>>,
    pub(crate) async_serializing: bool,
    pub(crate) pool: Option<BufferPool>,
    is_copy: bool,
}

impl<C: Codec> CodecContext<C> {
    pub fn new(codec: Arc<C>, priv_data: C::Context, params: StreamParams) -> Self {
        Self {
            codec,
            priv_data,
            params,
            user: UserFields::default(),
            internal: DecodeInternal::default(),
            accel: AccelBinding::None,
            thread: None,
            async_serializing: false,
            pool: None,
            is_copy: false,
        }
    }

    pub(crate) fn with_accel(mut self, accel: AccelBinding) -> Self {
        self.accel = accel;
        self
    }

    pub(crate) fn as_copy(mut self) -> Self {
        self.is_copy = true;
        self
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    pub fn caps(&self) -> CodecCaps {
        self.codec.caps()
    }

    /// True for every worker context but the first.
    pub fn is_copy(&self) -> bool {
        self.is_copy
    }

    pub fn is_frame_thread(&self) -> bool {
        self.thread.is_some()
    }

    pub fn is_draining(&self) -> bool {
        self.internal.draining
    }

    /// The accelerator, when one is bound and usable from this thread right now.
    pub fn accel_mut(&mut self) -> Option<&mut AccelState> {
        self.accel.state_mut()
    }

    pub fn accel_name(&self) -> Option<&'static str> {
        self.accel.descriptor().map(|d| d.name)
    }

    /// Marks the state a later thread copies forward as final. Everything the
    /// codec changes in [`Codec::export_forward`]'s view after this call is
    /// invisible to the next thread. No-op outside frame threads.
    pub fn finish_setup(&mut self) {
        if let Some(progress) = self.thread.clone() {
            progress.finish_setup(self);
        }
    }

    /// Next packet for a pull-style codec. Reports end of stream once the
    /// source is exhausted and keeps doing so until flushed.
    pub fn get_packet(&mut self, src: &mut dyn PacketSource) -> Result<Received<Packet>> {
        if self.internal.draining {
            return Ok(Received::Eof);
        }
        let received = src.get_packet()?;
        match &received {
            Received::Unit(pkt) if self.thread.is_none() => {
                self.user.last_pkt_props.copy_props(pkt);
            }
            Received::Eof => self.internal.draining = true,
            _ => {}
        }
        Ok(received)
    }

    /// Allocates `size` bytes of frame storage from a pool shared with the
    /// other threads and fills the frame's properties from the packet being
    /// decoded and the stream parameters.
    pub fn get_buffer(&mut self, frame: &mut Frame, size: usize) -> Result<()> {
        let pool = match &self.pool {
            Some(pool) if pool.size() == size => pool.clone(),
            _ => {
                let pool = BufferPool::new(size);
                self.pool = Some(pool.clone());
                pool
            }
        };
        frame.buf = pool.get()?;
        self.frame_props(frame);
        Ok(())
    }

    pub fn frame_props(&self, frame: &mut Frame) {
        let props = &self.user.last_pkt_props;
        frame.pts = props.pts;
        frame.duration = props.duration;
        frame.time_base = props.time_base;
        frame.key_frame = props.is_key();
        for sd in props.side_data.iter() {
            frame.side_data.clone_entry(sd);
        }
        frame.media_type = self.params.media_type;
        if self.params.is_video() {
            frame.width = self.params.width;
            frame.height = self.params.height;
            frame.format = self.params.pixel_format.clone();
        } else if self.params.is_audio() {
            frame.sample_rate = self.params.sample_rate;
            frame.channels = self.params.channels;
            frame.format = self.params.sample_format.clone();
        }
    }
}

impl<C: Codec> std::fmt::Debug for CodecContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecContext")
            .field("codec", &self.codec.name())
            .field("params", &self.params)
            .field("accel", &self.accel)
            .field("frame_thread", &self.thread.is_some())
            .field("is_copy", &self.is_copy)
            .finish()
    }
}
