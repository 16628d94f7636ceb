use bytes::Bytes;

use crate::buffer::Buffer;
use crate::packet::Packet;
use crate::side_data::SideDataList;
use crate::stream::{MediaType, Rational};

pub type FrameSender = tokio::sync::broadcast::Sender<FrameCmd>;
pub type FrameReceiver = tokio::sync::broadcast::Receiver<FrameCmd>;

#[derive(Debug, Clone)]
pub enum FrameCmd {
    Data(Frame),
    Eof,
}

/// Decoded output unit. `Clone` shares the sample storage.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub buf: Buffer,
    pub media_type: MediaType,
    pub pts: Option<i64>,
    pub pkt_dts: Option<i64>,
    pub duration: Option<i64>,
    pub best_effort_timestamp: Option<i64>,
    pub time_base: Rational,
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
    pub sample_rate: u32,
    pub nb_samples: u32,
    pub channels: u32,
    pub key_frame: bool,
    /// Set by an adapter that produced a frame the caller must never see.
    pub discard: bool,
    pub side_data: SideDataList,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        self.buf.data()
    }

    pub fn data_bytes(&self) -> Bytes {
        self.buf.to_bytes()
    }

    pub fn is_null(&self) -> bool {
        self.buf.is_null() && self.side_data.is_empty()
    }

    pub fn ref_frame(&self) -> Frame {
        self.clone()
    }

    pub fn move_ref(&mut self) -> Frame {
        std::mem::take(self)
    }

    pub fn unref(&mut self) {
        *self = Frame::default();
    }

    /// Fills the timing fields a push-style adapter leaves to the driver.
    pub fn set_packet_props(&mut self, pkt: &Packet) {
        self.pkt_dts = pkt.dts;
        if self.pts.is_none() {
            self.pts = pkt.pts;
        }
        if self.duration.is_none() {
            self.duration = pkt.duration;
        }
        if self.time_base == Rational::default() {
            self.time_base = pkt.time_base;
        }
    }

    /// Presentation time in milliseconds. `None` when unknown, negative or
    /// too large for `u64`.
    pub fn pts_ms(&self) -> Option<u64> {
        let time_base = self.time_base;
        if !time_base.is_valid() {
            return None;
        }
        let pts = u64::try_from(self.pts?).ok()?;
        let num = u64::try_from(time_base.num).ok()?;
        let den = u64::try_from(time_base.den).ok().filter(|d| *d > 0)?;
        pts.checked_mul(1000)?.checked_mul(num).map(|v| v / den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_packet_props_keeps_adapter_pts() {
        let mut pkt = Packet::from_vec(vec![0; 4]).with_pts(40);
        pkt.dts = Some(20);
        pkt.time_base = Rational::new(1, 1000);

        let mut frame = Frame::new();
        frame.pts = Some(7);
        frame.set_packet_props(&pkt);
        assert_eq!(frame.pts, Some(7));
        assert_eq!(frame.pkt_dts, Some(20));
        assert_eq!(frame.time_base, Rational::new(1, 1000));
    }

    #[test]
    fn test_pts_ms() {
        let mut frame = Frame::new();
        frame.pts = Some(180000);
        frame.time_base = Rational::new(1, 90000);
        assert_eq!(frame.pts_ms(), Some(2000));
        frame.time_base = Rational::new(1, 0);
        assert_eq!(frame.pts_ms(), None);

        frame.time_base = Rational::new(1001, 30000);
        frame.pts = Some(i64::MAX / 10);
        assert_eq!(frame.pts_ms(), None);
        frame.pts = Some(-5);
        assert_eq!(frame.pts_ms(), None);
    }

    #[test]
    fn test_move_ref() {
        let mut frame = Frame::new();
        frame.buf = Buffer::from_vec(vec![1, 2]);
        frame.key_frame = true;
        let moved = frame.move_ref();
        assert!(frame.is_null());
        assert!(!frame.key_frame);
        assert_eq!(moved.data(), &[1, 2]);
    }
}
