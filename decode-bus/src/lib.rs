//! Codec-agnostic decode pipeline: bitstream filters in front of a pluggable
//! codec, run sequentially or spread over frame threads with output kept in
//! submission order.

pub mod accel;
pub mod bsf;
pub mod buffer;
pub mod codec;
pub mod codecs;
pub mod config;
pub mod decode;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod packet;
pub mod registry;
pub mod scheduler;
pub mod side_data;
pub mod slot;
pub mod stream;
pub mod task;

pub use codec::{Codec, CodecCaps, CodecContext, CodecKind, DecodeOutcome, Discard, PacketSource};
pub use config::{DecoderConfig, DrainErrorBudget};
pub use decoder::{Decoder, Pull};
pub use error::{Error, Received, Result};
pub use frame::{Frame, FrameCmd};
pub use packet::{Packet, PacketCmd, Sent};
pub use registry::Registry;
pub use stream::{MediaType, Rational, StreamParams};
