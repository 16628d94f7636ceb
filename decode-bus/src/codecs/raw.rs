use crate::codec::{Codec, CodecCaps, CodecContext, DecodeOutcome, Discard};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::stream::StreamParams;

/// Pass-through adapter: every packet becomes one frame holding a copy of
/// its payload. Keeps a running frame counter that later threads continue
/// from.
#[derive(Debug, Default)]
pub struct RawDecoder {
    /// Rejects packets larger than this many bytes. 0 means no limit.
    pub max_packet_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RawState {
    pub frames_decoded: u64,
}

impl Codec for RawDecoder {
    type Context = RawState;
    type Forward = u64;

    fn name(&self) -> &'static str {
        "raw"
    }

    fn caps(&self) -> CodecCaps {
        CodecCaps {
            update_thread_context: true,
            ..CodecCaps::default()
        }
    }

    fn init(&self, params: &StreamParams) -> Result<RawState> {
        if params.is_video() && (params.width == 0 || params.height == 0) {
            return Err(Error::InvalidArgument(format!(
                "raw video needs dimensions, got {}x{}",
                params.width, params.height
            )));
        }
        Ok(RawState::default())
    }

    fn fork(&self, canonical: &RawState) -> Result<RawState> {
        Ok(canonical.clone())
    }

    fn export_forward(&self, ctx: &RawState) -> u64 {
        ctx.frames_decoded
    }

    fn update_thread_context(&self, dst: &mut CodecContext<Self>, src: &u64) -> Result<()> {
        dst.priv_data.frames_decoded = *src;
        Ok(())
    }

    fn decode(&self, ctx: &mut CodecContext<Self>, pkt: &Packet, frame: &mut Frame) -> Result<DecodeOutcome> {
        if self.max_packet_size > 0 && pkt.size() > self.max_packet_size {
            return Err(Error::Decode(format!(
                "packet of {} bytes exceeds {}",
                pkt.size(),
                self.max_packet_size
            )));
        }

        ctx.priv_data.frames_decoded += 1;
        ctx.finish_setup();

        let skip = match ctx.user.skip_frame {
            Discard::None => false,
            Discard::NonKey => !pkt.is_key(),
            Discard::All => true,
        };
        if skip {
            frame.discard = true;
            return Ok(DecodeOutcome::frame(pkt.size()));
        }

        ctx.get_buffer(frame, pkt.size())?;
        frame.buf.data_mut()?.copy_from_slice(pkt.data());
        if let Some(accel) = ctx.accel_mut() {
            accel.frames_decoded += 1;
        }
        Ok(DecodeOutcome::frame(pkt.size()))
    }

    fn flush(&self, ctx: &mut CodecContext<Self>) {
        log::trace!("raw decoder flushed after {} frames", ctx.priv_data.frames_decoded);
    }
}
