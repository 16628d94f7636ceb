//! Drives one codec context: the uniform "receive one frame" entry used both
//! by the sequential decoder and by every frame thread.

use std::sync::Arc;

use crate::codec::{Codec, CodecContext, CodecKind, DecodeOutcome, Discard, PacketSource};
use crate::error::{Error, Received, Result};
use crate::frame::Frame;
use crate::packet::Packet;

/// Per-context decode progress.
#[derive(Debug, Default)]
pub(crate) struct DecodeInternal {
    /// Remainder of a partially consumed packet.
    pub in_pkt: Packet,
    /// The packet source reported end of stream.
    pub draining: bool,
    /// The codec has nothing more to give.
    pub draining_done: bool,
}

impl DecodeInternal {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Settings and bookkeeping owned by the caller and copied into a frame
/// thread each time it is handed a packet.
#[derive(Debug, Clone, Default)]
pub struct UserFields {
    pub skip_frame: Discard,
    pub frame_num: u64,
    /// Properties of the packet being decoded.
    pub last_pkt_props: Packet,
}

pub(crate) fn receive_frame_internal<C: Codec>(
    ctx: &mut CodecContext<C>,
    src: &mut dyn PacketSource,
) -> Result<Received<Frame>> {
    let codec = Arc::clone(ctx.codec());
    let received = match codec.caps().kind {
        CodecKind::ReceiveFrame => loop {
            match codec.receive_frame(ctx, src)? {
                Received::Unit(frame) if frame.discard => continue,
                other => break other,
            }
        },
        CodecKind::Decode => loop {
            match decode_simple_internal(codec.as_ref(), ctx, src)? {
                Received::Unit(Some(frame)) => break Received::Unit(frame),
                Received::Unit(None) => continue,
                Received::NeedInput => break Received::NeedInput,
                Received::Eof => break Received::Eof,
            }
        },
    };
    if received.is_eof() {
        ctx.internal.draining_done = true;
    }
    Ok(received)
}

/// One call into a push-style codec. `Unit(None)` means the call made
/// progress without producing a frame.
fn decode_simple_internal<C: Codec>(
    codec: &C,
    ctx: &mut CodecContext<C>,
    src: &mut dyn PacketSource,
) -> Result<Received<Option<Frame>>> {
    if ctx.internal.in_pkt.is_empty() && !ctx.internal.draining {
        match ctx.get_packet(src)? {
            Received::Unit(pkt) => ctx.internal.in_pkt = pkt,
            Received::NeedInput => return Ok(Received::NeedInput),
            Received::Eof => {}
        }
    }

    // codecs without delay are never called with drain packets
    if ctx.internal.draining_done {
        return Ok(Received::Eof);
    }
    if ctx.internal.in_pkt.is_empty() && !codec.caps().delay {
        return Ok(Received::Eof);
    }

    let mut pkt = ctx.internal.in_pkt.move_ref();
    let mut frame = Frame::new();
    let DecodeOutcome {
        consumed,
        got_frame,
    } = codec.decode(ctx, &pkt, &mut frame)?;
    frame.set_packet_props(&pkt);

    if ctx.internal.draining && !got_frame {
        ctx.internal.draining_done = true;
    }

    if consumed < pkt.size() {
        if consumed == 0 && !got_frame {
            return Err(Error::Decode(format!(
                "{} made no progress on a {} byte packet",
                codec.name(),
                pkt.size()
            )));
        }
        pkt.advance(consumed);
        ctx.user.last_pkt_props.pts = None;
        ctx.user.last_pkt_props.dts = None;
        ctx.internal.in_pkt = pkt;
    }

    Ok(Received::Unit((got_frame && !frame.discard).then_some(frame)))
}

/// Guesses monotonic timestamps from reordered pts and decode order dts.
#[derive(Debug, Default)]
pub(crate) struct PtsCorrection {
    num_faulty_pts: u64,
    num_faulty_dts: u64,
    last_pts: Option<i64>,
    last_dts: Option<i64>,
}

impl PtsCorrection {
    pub fn guess(&mut self, reordered_pts: Option<i64>, dts: Option<i64>) -> Option<i64> {
        if let Some(dts) = dts {
            if self.last_dts.is_some_and(|last| dts <= last) {
                self.num_faulty_dts += 1;
            }
            self.last_dts = Some(dts);
        } else if reordered_pts.is_some() {
            self.last_dts = reordered_pts;
        }

        if let Some(pts) = reordered_pts {
            if self.last_pts.is_some_and(|last| pts <= last) {
                self.num_faulty_pts += 1;
            }
            self.last_pts = Some(pts);
        } else if dts.is_some() {
            self.last_pts = dts;
        }

        if (self.num_faulty_pts <= self.num_faulty_dts || dts.is_none()) && reordered_pts.is_some() {
            reordered_pts
        } else {
            dts
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
