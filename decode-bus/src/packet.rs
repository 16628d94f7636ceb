use bytes::Bytes;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::side_data::SideDataList;
use crate::stream::Rational;

pub type PacketSender = tokio::sync::mpsc::Sender<PacketCmd>;
pub type PacketReceiver = tokio::sync::mpsc::Receiver<PacketCmd>;

#[derive(Debug)]
pub enum PacketCmd {
    Data(Packet),
    Eof,
}

/// Outcome of handing a unit to a stage with a one-unit input slot.
#[derive(Debug)]
pub enum Sent {
    Accepted,
    /// The previous unit has not been drained yet; ownership comes back.
    WouldBlock(Packet),
}

impl Sent {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Sent::Accepted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    pub key: bool,
    pub corrupt: bool,
    pub discard: bool,
}

/// Encoded input unit. `Clone` produces a second reference to the same
/// payload; use [`Packet::make_writable`] before editing the bytes.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    buf: Buffer,
    offset: usize,
    size: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    pub pos: Option<i64>,
    pub flags: PacketFlags,
    pub stream_index: usize,
    pub time_base: Rational,
    pub side_data: SideDataList,
}

impl Packet {
    pub fn new(buf: Buffer) -> Self {
        let size = buf.len();
        Self {
            buf,
            size,
            ..Default::default()
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::new(Buffer::from_vec(data))
    }

    pub fn from_bytes(data: &Bytes) -> Self {
        Self::new(Buffer::from_bytes(data))
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self.dts = Some(pts);
        self
    }

    pub fn with_key(mut self, key: bool) -> Self {
        self.flags.key = key;
        self
    }

    pub fn data(&self) -> &[u8] {
        let data = self.buf.data();
        let end = (self.offset + self.size).min(data.len());
        &data[self.offset.min(end)..end]
    }

    pub fn data_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.data())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    pub fn is_key(&self) -> bool {
        self.flags.key
    }

    /// No payload and no side data: used as the end-of-stream marker.
    pub fn is_empty(&self) -> bool {
        self.size == 0 && self.side_data.is_empty()
    }

    /// New packet referencing the same payload with copied properties.
    pub fn ref_packet(&self) -> Packet {
        self.clone()
    }

    /// Moves everything out, leaving this packet blank.
    pub fn move_ref(&mut self) -> Packet {
        std::mem::take(self)
    }

    pub fn unref(&mut self) {
        *self = Packet::default();
    }

    /// Copies every property except the payload. Side data entries are
    /// shared with `src`.
    pub fn copy_props(&mut self, src: &Packet) {
        self.pts = src.pts;
        self.dts = src.dts;
        self.duration = src.duration;
        self.pos = src.pos;
        self.flags = src.flags;
        self.stream_index = src.stream_index;
        self.time_base = src.time_base;
        self.side_data = src.side_data.clone();
    }

    pub fn make_writable(&mut self) -> Result<()> {
        if self.buf.is_writable() || self.buf.is_null() {
            return Ok(());
        }
        let mut copy = Buffer::copy_from_slice(self.data())?;
        std::mem::swap(&mut self.buf, &mut copy);
        self.offset = 0;
        Ok(())
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let (offset, size) = (self.offset, self.size);
        let data = self.buf.data_mut()?;
        Ok(&mut data[offset..offset + size])
    }

    /// Drops the first `consumed` bytes after a partial decode. The
    /// remainder no longer carries the packet's timestamps.
    pub fn advance(&mut self, consumed: usize) {
        let consumed = consumed.min(self.size);
        self.offset += consumed;
        self.size -= consumed;
        self.pts = None;
        self.dts = None;
    }

    /// Splits off the first `at` bytes as a packet sharing this payload. The
    /// head keeps every property; the remainder is left without timestamps,
    /// key flag or side data.
    pub fn split_to(&mut self, at: usize) -> Packet {
        let at = at.min(self.size);
        let mut head = self.clone();
        head.size = at;
        self.advance(at);
        self.flags.key = false;
        self.side_data = SideDataList::new();
        head
    }

    pub fn rescale_ts(&mut self, from: Rational, to: Rational) {
        self.pts = self.pts.map(|ts| from.rescale(ts, to));
        self.dts = self.dts.map(|ts| from.rescale(ts, to));
        self.duration = self.duration.map(|d| from.rescale(d, to));
        self.time_base = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side_data::SideDataType;

    #[test]
    fn test_ref_packet_shares_payload() {
        let pkt = Packet::from_vec(vec![1, 2, 3]).with_pts(10);
        let copy = pkt.ref_packet();
        assert!(copy.buffer().same_storage(pkt.buffer()));
        assert_eq!(copy.pts, Some(10));
        assert_eq!(pkt.buffer().ref_count(), 2);
    }

    #[test]
    fn test_move_ref_blanks_source() {
        let mut pkt = Packet::from_vec(vec![1]).with_pts(3);
        let moved = pkt.move_ref();
        assert!(pkt.is_empty());
        assert_eq!(pkt.pts, None);
        assert_eq!(moved.data(), &[1]);
    }

    #[test]
    fn test_advance_clears_timestamps() {
        let mut pkt = Packet::from_vec(vec![1, 2, 3, 4]).with_pts(7);
        pkt.advance(3);
        assert_eq!(pkt.data(), &[4]);
        assert_eq!(pkt.pts, None);
        assert_eq!(pkt.dts, None);
        pkt.advance(10);
        assert!(pkt.is_empty());
    }

    #[test]
    fn test_make_writable_keeps_window() {
        let mut pkt = Packet::from_vec(vec![1, 2, 3, 4]);
        let other = pkt.ref_packet();
        pkt.advance(2);
        pkt.make_writable().unwrap();
        pkt.data_mut().unwrap()[0] = 9;
        assert_eq!(pkt.data(), &[9, 4]);
        assert_eq!(other.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_side_data_only_packet_is_not_empty() {
        let mut pkt = Packet::default();
        assert!(pkt.is_empty());
        pkt.side_data
            .new_entry(SideDataType::NewExtradata, 2)
            .unwrap();
        assert!(!pkt.is_empty());
    }

    #[test]
    fn test_copy_props() {
        let mut src = Packet::from_vec(vec![1]).with_pts(5).with_key(true);
        src.stream_index = 2;
        src.time_base = Rational::new(1, 90000);
        let mut dst = Packet::from_vec(vec![9, 9]);
        dst.copy_props(&src);
        assert_eq!(dst.pts, Some(5));
        assert!(dst.is_key());
        assert_eq!(dst.stream_index, 2);
        assert_eq!(dst.data(), &[9, 9]);
    }
}
