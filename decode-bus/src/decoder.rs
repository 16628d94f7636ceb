use std::sync::Arc;

use crate::accel::{AccelBinding, AccelState};
use crate::bsf::{self, FilterContext};
use crate::codec::{Codec, CodecContext, Discard, PacketSource};
use crate::config::DecoderConfig;
use crate::decode::{self, PtsCorrection, UserFields};
use crate::error::{Error, Received, Result};
use crate::frame::Frame;
use crate::packet::{Packet, Sent};
use crate::registry::Registry;
use crate::scheduler::FrameThreads;
use crate::stream::StreamParams;

/// What [`Decoder::pull_output`] produced.
#[derive(Debug)]
pub enum Pull {
    Frame(Frame),
    /// Send another packet first.
    NeedMore,
    /// Drained. Returned for every call until the decoder is flushed.
    Eof,
}

enum Mode<C: Codec> {
    Sequential(Box<CodecContext<C>>),
    Threaded(FrameThreads<C>),
    Closed,
}

/// Packets for the codec: whatever the filter chain has ready, refilled from
/// the caller's one-packet buffer.
struct FilterSource<'a> {
    bsf: &'a mut FilterContext,
    buffer_pkt: &'a mut Option<Packet>,
    draining: bool,
    eof_sent: bool,
}

impl PacketSource for FilterSource<'_> {
    fn get_packet(&mut self) -> Result<Received<Packet>> {
        loop {
            match self.bsf.receive()? {
                Received::NeedInput => {}
                other => return Ok(other),
            }
            if let Some(pkt) = self.buffer_pkt.take() {
                if let Sent::WouldBlock(pkt) = self.bsf.send(Some(pkt))? {
                    *self.buffer_pkt = Some(pkt);
                    return Err(Error::InvariantBroken(format!(
                        "filter {} refused input after asking for it",
                        self.bsf.name()
                    )));
                }
            } else if self.draining && !self.eof_sent {
                self.bsf.send(None)?;
                self.eof_sent = true;
            } else if self.draining {
                return Err(Error::InvariantBroken(format!(
                    "filter {} wants input after end of stream",
                    self.bsf.name()
                )));
            } else {
                return Ok(Received::NeedInput);
            }
        }
    }
}

/// Caller-facing decoder: a filter chain feeding one codec, run either on
/// the calling thread or on a ring of frame threads.
///
/// Input goes in with [`Decoder::send_packet`], output comes out of
/// [`Decoder::pull_output`]. Both sides are non-blocking in the sense that
/// they report backpressure instead of waiting for the other side.
pub struct Decoder<C: Codec> {
    codec: Arc<C>,
    mode: Mode<C>,
    bsf: FilterContext,
    params: StreamParams,
    accel_name: Option<&'static str>,
    thread_count: usize,
    buffer_pkt: Option<Packet>,
    buffer_frame: Option<Frame>,
    pending_error: Option<Error>,
    draining_started: bool,
    eof_sent: bool,
    eof_returned: bool,
    drain_errors: usize,
    drain_budget: usize,
    pts_correction: PtsCorrection,
}

impl<C: Codec> Decoder<C> {
    pub fn new(config: &DecoderConfig, codec: C, params: StreamParams, registry: &Registry) -> Result<Self> {
        let codec = Arc::new(codec);
        let caps = codec.caps();
        let thread_count = if caps.frame_threads {
            config.resolve_thread_count()
        } else {
            1
        };

        let accel = config.accel.as_deref().and_then(|name| {
            let found = registry.find_accel(&params.codec_id, name);
            if found.is_none() {
                log::warn!(
                    "decode accelerator {} not available for {}, decoding in software",
                    name,
                    params.codec_id
                );
            }
            found
        });

        let mut bsf = bsf::parse_filter_list(registry, &config.filters)?.finalize();
        bsf.init(&params, params.time_base)?;
        let mut params = bsf.par_out.clone();
        params.time_base = bsf.time_base_out;

        let canonical = codec.init(&params)?;
        let mut mode = if thread_count > 1 {
            Mode::Threaded(FrameThreads::new(
                Arc::clone(&codec),
                &params,
                &canonical,
                thread_count,
                accel.as_ref(),
            )?)
        } else {
            let binding = accel
                .clone()
                .map(|desc| AccelBinding::Private(AccelState::new(desc)))
                .unwrap_or_default();
            Mode::Sequential(Box::new(
                CodecContext::new(Arc::clone(&codec), canonical, params.clone()).with_accel(binding),
            ))
        };
        if let Some(user) = user_fields(&mut mode) {
            user.skip_frame = config.skip_frame;
        }

        log::info!(
            "opened {} decoder: {} thread(s), filter {}, accelerator {}",
            codec.name(),
            thread_count,
            bsf.name(),
            accel.as_ref().map(|d| d.name).unwrap_or("none")
        );

        Ok(Self {
            codec,
            mode,
            bsf,
            params,
            accel_name: accel.map(|d| d.name),
            thread_count,
            buffer_pkt: None,
            buffer_frame: None,
            pending_error: None,
            draining_started: false,
            eof_sent: false,
            eof_returned: false,
            drain_errors: 0,
            drain_budget: config.drain_error_budget.limit(thread_count),
            pts_correction: PtsCorrection::default(),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn accel_name(&self) -> Option<&'static str> {
        self.accel_name
    }

    pub fn filter_name(&self) -> &'static str {
        self.bsf.name()
    }

    /// Stream parameters as currently seen by the caller.
    pub fn params(&self) -> &StreamParams {
        match &self.mode {
            Mode::Sequential(ctx) => &ctx.params,
            Mode::Threaded(ft) => ft.params(),
            Mode::Closed => &self.params,
        }
    }

    pub fn set_skip_frame(&mut self, skip: Discard) {
        if let Some(user) = user_fields(&mut self.mode) {
            user.skip_frame = skip;
        }
    }

    /// Frames returned so far.
    pub fn frame_num(&self) -> u64 {
        match &self.mode {
            Mode::Sequential(ctx) => ctx.user.frame_num,
            Mode::Threaded(ft) => ft.user.frame_num,
            Mode::Closed => 0,
        }
    }

    /// Hands one packet to the decoder; `None` or an empty packet starts
    /// draining. A packet that cannot be taken yet comes back in
    /// [`Sent::WouldBlock`]: pull output and send it again.
    pub fn send_packet(&mut self, pkt: Option<Packet>) -> Result<Sent> {
        self.ensure_open()?;
        if self.draining_started {
            return Err(Error::Eof);
        }

        match pkt.filter(|p| !p.is_empty()) {
            Some(pkt) => {
                if self.buffer_pkt.is_some() {
                    return Ok(Sent::WouldBlock(pkt));
                }
                self.buffer_pkt = Some(pkt);
            }
            None => self.draining_started = true,
        }

        if self.buffer_frame.is_none() && self.pending_error.is_none() && !self.draining_started {
            match self.decode_one() {
                Ok(Received::Unit(frame)) => self.buffer_frame = Some(frame),
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.pending_error = Some(e),
            }
        }
        Ok(Sent::Accepted)
    }

    /// Next decoded frame, in the order the packets were sent. A decode
    /// error is reported once, in place of the frame(s) it cost; decoding
    /// continues on the next call.
    pub fn pull_output(&mut self) -> Result<Pull> {
        self.ensure_open()?;
        if self.eof_returned {
            return Ok(Pull::Eof);
        }

        loop {
            let received = match self.buffer_frame.take() {
                Some(frame) => Ok(Received::Unit(frame)),
                None => match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => self.decode_one(),
                },
            };

            match received {
                Ok(Received::Unit(frame)) => {
                    self.drain_errors = 0;
                    return Ok(Pull::Frame(self.deliver(frame)));
                }
                Ok(Received::NeedInput) if self.draining_started => {
                    self.count_drain_error(&Error::Decode("no output while draining".to_string()))?;
                }
                Ok(Received::NeedInput) => return Ok(Pull::NeedMore),
                Ok(Received::Eof) => {
                    log::debug!("{} decoder drained after {} frames", self.codec.name(), self.frame_num());
                    self.eof_returned = true;
                    return Ok(Pull::Eof);
                }
                Err(e) if self.draining_started && !e.is_fatal() => {
                    self.count_drain_error(&e)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Same as [`Decoder::pull_output`].
    pub fn receive_frame(&mut self) -> Result<Pull> {
        self.pull_output()
    }

    /// Drops everything buffered and in flight so decoding can restart at a
    /// discontinuity. Clears draining and end of stream.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        match &mut self.mode {
            Mode::Sequential(ctx) => {
                ctx.internal.reset();
                ctx.user.last_pkt_props = Packet::default();
                let codec = Arc::clone(ctx.codec());
                codec.flush(ctx);
            }
            Mode::Threaded(ft) => ft.flush()?,
            Mode::Closed => {}
        }
        self.bsf.flush();
        self.buffer_pkt = None;
        self.buffer_frame = None;
        self.pending_error = None;
        self.draining_started = false;
        self.eof_sent = false;
        self.eof_returned = false;
        self.drain_errors = 0;
        self.pts_correction.reset();
        log::debug!("{} decoder flushed", self.codec.name());
        Ok(())
    }

    /// Stops the frame threads and closes the codec. Returns the accelerator
    /// state, if one was in use.
    pub fn close(mut self) -> Result<Option<AccelState>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<Option<AccelState>> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Sequential(mut ctx) => {
                let codec = Arc::clone(ctx.codec());
                codec.close(&mut ctx);
                Ok(ctx.accel_mut().cloned())
            }
            Mode::Threaded(mut ft) => ft.teardown(),
            Mode::Closed => Ok(None),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.mode {
            Mode::Closed => Err(Error::ContractViolation("decoder is closed".to_string())),
            _ => Ok(()),
        }
    }

    fn decode_one(&mut self) -> Result<Received<Frame>> {
        let mut src = FilterSource {
            bsf: &mut self.bsf,
            buffer_pkt: &mut self.buffer_pkt,
            draining: self.draining_started,
            eof_sent: self.eof_sent,
        };
        let received = match &mut self.mode {
            Mode::Sequential(ctx) => decode::receive_frame_internal(ctx, &mut src),
            Mode::Threaded(ft) => ft.receive_frame(&mut src),
            Mode::Closed => Err(Error::ContractViolation("decoder is closed".to_string())),
        };
        self.eof_sent = src.eof_sent;
        received
    }

    fn count_drain_error(&mut self, e: &Error) -> Result<()> {
        self.drain_errors += 1;
        if self.drain_errors > self.drain_budget {
            log::error!(
                "too many errors while draining {} ({}), last: {}",
                self.codec.name(),
                self.drain_errors,
                e
            );
            self.eof_returned = true;
            return Err(Error::InvariantBroken(format!(
                "{} errors while draining without output",
                self.drain_errors
            )));
        }
        Ok(())
    }

    /// Fills what the codec left unset and counts the frame.
    fn deliver(&mut self, mut frame: Frame) -> Frame {
        frame.best_effort_timestamp = self.pts_correction.guess(frame.pts, frame.pkt_dts);

        let params = self.params();
        if params.is_video() {
            if frame.width == 0 && frame.height == 0 {
                frame.width = params.width;
                frame.height = params.height;
            }
            if frame.format.is_none() {
                frame.format = params.pixel_format.clone();
            }
        } else if params.is_audio() {
            if frame.sample_rate == 0 {
                frame.sample_rate = params.sample_rate;
            }
            if frame.channels == 0 {
                frame.channels = params.channels;
            }
            if frame.format.is_none() {
                frame.format = params.sample_format.clone();
            }
        }
        if !frame.time_base.is_valid() {
            frame.time_base = params.time_base;
        }

        if let Some(user) = user_fields(&mut self.mode) {
            user.frame_num += 1;
        }
        frame
    }
}

impl<C: Codec> Drop for Decoder<C> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("{} decoder close failed: {}", self.codec.name(), e);
        }
    }
}

fn user_fields<C: Codec>(mode: &mut Mode<C>) -> Option<&mut UserFields> {
    match mode {
        Mode::Sequential(ctx) => Some(&mut ctx.user),
        Mode::Threaded(ft) => Some(&mut ft.user),
        Mode::Closed => None,
    }
}
