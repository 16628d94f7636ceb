//! Bitstream filters: per-filter contexts with a one-packet input slot, the
//! list filter that chains several of them, and the built-in filters.

use std::collections::BTreeMap;

use bytes::BytesMut;

use crate::error::{Error, Received, Result};
use crate::packet::{Packet, Sent};
use crate::registry::Registry;
use crate::stream::{Rational, StreamParams};

/// Input side of a filter: the packet buffered by [`FilterContext::send`] and
/// whether end of stream was signalled.
pub struct FilterInput<'a> {
    buffer: &'a mut Option<Packet>,
    eof: bool,
}

impl FilterInput<'_> {
    pub fn get_packet(&mut self) -> Received<Packet> {
        match self.buffer.take() {
            Some(pkt) => Received::Unit(pkt),
            None if self.eof => Received::Eof,
            None => Received::NeedInput,
        }
    }
}

pub trait BitstreamFilter: Send {
    fn name(&self) -> &'static str;

    /// Codec ids the filter accepts. Empty means any.
    fn codec_ids(&self) -> &'static [&'static str] {
        &[]
    }

    /// Called once with the output parameters pre-filled from the input.
    fn init(&mut self, _par_out: &mut StreamParams, _time_base_out: &mut Rational) -> Result<()> {
        Ok(())
    }

    fn filter(&mut self, input: &mut FilterInput<'_>) -> Result<Received<Packet>>;

    fn flush(&mut self) {}
}

pub struct FilterContext {
    filter: Box<dyn BitstreamFilter>,
    buffer: Option<Packet>,
    eof: bool,
    pub par_in: StreamParams,
    pub par_out: StreamParams,
    pub time_base_in: Rational,
    pub time_base_out: Rational,
}

impl FilterContext {
    pub fn new(filter: Box<dyn BitstreamFilter>) -> Self {
        Self {
            filter,
            buffer: None,
            eof: false,
            par_in: StreamParams::default(),
            par_out: StreamParams::default(),
            time_base_in: Rational::default(),
            time_base_out: Rational::default(),
        }
    }

    pub fn null() -> Self {
        Self::new(Box::new(NullFilter))
    }

    pub fn name(&self) -> &'static str {
        self.filter.name()
    }

    pub fn init(&mut self, par_in: &StreamParams, time_base_in: Rational) -> Result<()> {
        let supported = self.filter.codec_ids();
        if !supported.is_empty() && !supported.contains(&par_in.codec_id.as_str()) {
            log::error!(
                "codec '{}' is not supported by the bitstream filter '{}', supported codecs are: {}",
                par_in.codec_id,
                self.filter.name(),
                supported.join(" ")
            );
            return Err(Error::InvalidArgument(format!(
                "codec {} not supported by {}",
                par_in.codec_id,
                self.filter.name()
            )));
        }
        self.par_in = par_in.clone();
        self.par_out = par_in.clone();
        self.time_base_in = time_base_in;
        self.time_base_out = time_base_in;
        self.filter
            .init(&mut self.par_out, &mut self.time_base_out)
    }

    /// Hands one packet to the filter. `None` or an empty packet signals end
    /// of stream.
    pub fn send(&mut self, pkt: Option<Packet>) -> Result<Sent> {
        let pkt = match pkt {
            Some(pkt) if !pkt.is_empty() => pkt,
            _ => {
                self.eof = true;
                return Ok(Sent::Accepted);
            }
        };
        if self.eof {
            log::error!("a non-empty packet sent after an EOF");
            return Err(Error::InvalidArgument(
                "packet sent after end of stream".to_string(),
            ));
        }
        if self.buffer.is_some() {
            return Ok(Sent::WouldBlock(pkt));
        }
        self.buffer = Some(pkt);
        Ok(Sent::Accepted)
    }

    pub fn receive(&mut self) -> Result<Received<Packet>> {
        let mut input = FilterInput {
            buffer: &mut self.buffer,
            eof: self.eof,
        };
        self.filter.filter(&mut input)
    }

    pub fn flush(&mut self) {
        self.eof = false;
        self.buffer = None;
        self.filter.flush();
    }
}

/// Filters collected from a description before they are fused into one
/// context by [`FilterList::finalize`].
#[derive(Default)]
pub struct FilterList {
    filters: Vec<Box<dyn BitstreamFilter>>,
}

impl FilterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, filter: Box<dyn BitstreamFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// One filter collapses to itself; anything else becomes a chain, which
    /// passes packets through untouched when empty.
    pub fn finalize(mut self) -> FilterContext {
        if self.filters.len() == 1 {
            if let Some(filter) = self.filters.pop() {
                return FilterContext::new(filter);
            }
        }
        let stages = self.filters.into_iter().map(FilterContext::new).collect();
        FilterContext::new(Box::new(FilterChain { stages, idx: 0 }))
    }
}

/// Runs packets through `stages` in order. `idx` is the stage the next
/// packet is fed into; stage `idx - 1` is the one pulled from.
struct FilterChain {
    stages: Vec<FilterContext>,
    idx: usize,
}

impl BitstreamFilter for FilterChain {
    fn name(&self) -> &'static str {
        "bsf_list"
    }

    fn init(&mut self, par_out: &mut StreamParams, time_base_out: &mut Rational) -> Result<()> {
        let mut par = par_out.clone();
        let mut tb = *time_base_out;
        for stage in &mut self.stages {
            stage.init(&par, tb)?;
            par = stage.par_out.clone();
            tb = stage.time_base_out;
        }
        *par_out = par;
        *time_base_out = tb;
        Ok(())
    }

    fn filter(&mut self, input: &mut FilterInput<'_>) -> Result<Received<Packet>> {
        if self.stages.is_empty() {
            return Ok(input.get_packet());
        }
        loop {
            let received = if self.idx > 0 {
                self.stages[self.idx - 1].receive()?
            } else {
                input.get_packet()
            };
            let pkt = match received {
                Received::NeedInput => {
                    if self.idx == 0 {
                        return Ok(Received::NeedInput);
                    }
                    self.idx -= 1;
                    continue;
                }
                Received::Eof => None,
                Received::Unit(pkt) => Some(pkt),
            };

            if self.idx < self.stages.len() {
                if let Sent::WouldBlock(_) = self.stages[self.idx].send(pkt)? {
                    return Err(Error::InvariantBroken(format!(
                        "filter stage {} still holds a packet",
                        self.idx
                    )));
                }
                self.idx += 1;
            } else {
                return Ok(match pkt {
                    Some(pkt) => Received::Unit(pkt),
                    None => Received::Eof,
                });
            }
        }
    }

    fn flush(&mut self) {
        for stage in &mut self.stages {
            stage.flush();
        }
        self.idx = 0;
    }
}

pub struct NullFilter;

impl BitstreamFilter for NullFilter {
    fn name(&self) -> &'static str {
        "null"
    }

    fn filter(&mut self, input: &mut FilterInput<'_>) -> Result<Received<Packet>> {
        Ok(input.get_packet())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOptions(BTreeMap<String, String>);

impl FilterOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| {
                Error::InvalidArgument(format!("option {}: '{}' is not a number", key, v))
            }),
        }
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }
}

/// Parses `"name[=key=value[:key=value...]][,name...]"` into filters known to
/// `registry`. A blank description yields an empty list.
pub fn parse_filter_list(registry: &Registry, desc: &str) -> Result<FilterList> {
    let mut list = FilterList::new();
    for single in desc.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, opts) = match single.split_once('=') {
            Some((name, rest)) => (name, parse_options(rest)?),
            None => (single, FilterOptions::default()),
        };
        let filter = registry.create_filter(name, &opts)?;
        list.append(filter);
    }
    Ok(list)
}

fn parse_options(s: &str) -> Result<FilterOptions> {
    let mut opts = FilterOptions::default();
    for pair in s.split(':').filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| Error::InvalidArgument(format!("malformed filter option '{}'", pair)))?;
        opts.insert(k, v);
    }
    Ok(opts)
}

/// Check if packet data is in Annex B format by looking at the start codes.
pub fn is_annexb_packet(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x00 && data[3] == 0x01 {
        return true;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x01 {
        return true;
    }
    false
}

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Appends each `length_size`-prefixed NAL of `data` to `out` behind a start
/// code. Fails on a NAL that runs past the end of `data`.
fn append_length_prefixed(out: &mut BytesMut, data: &[u8], length_size: usize) -> Result<()> {
    let mut i = 0;
    while i + length_size <= data.len() {
        let len = data[i..i + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        i += length_size;
        if len == 0 || i + len > data.len() {
            return Err(Error::Decode(format!(
                "invalid NAL unit size {} at offset {}",
                len,
                i - length_size
            )));
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&data[i..i + len]);
        i += len;
    }
    Ok(())
}

/// Parameter sets and NAL length size read from an `avcC` record.
fn parse_avcc(extradata: &[u8]) -> Result<(Vec<u8>, usize)> {
    let invalid = || Error::InvalidArgument("invalid avcC extradata".to_string());
    if extradata.len() < 7 || extradata[0] != 1 {
        return Err(invalid());
    }
    let length_size = usize::from(extradata[4] & 0x03) + 1;
    let mut out = Vec::new();
    let mut pos = 5;
    for mask in [0x1f_u8, 0xff] {
        let count = usize::from(*extradata.get(pos).ok_or_else(invalid)? & mask);
        pos += 1;
        for _ in 0..count {
            pos = copy_parameter_set(extradata, pos, &mut out).ok_or_else(invalid)?;
        }
    }
    Ok((out, length_size))
}

/// Same for an `hvcC` record.
fn parse_hvcc(extradata: &[u8]) -> Result<(Vec<u8>, usize)> {
    let invalid = || Error::InvalidArgument("invalid hvcC extradata".to_string());
    if extradata.len() < 23 || extradata[0] != 1 {
        return Err(invalid());
    }
    let length_size = usize::from(extradata[21] & 0x03) + 1;
    let arrays = usize::from(extradata[22]);
    let mut out = Vec::new();
    let mut pos = 23;
    for _ in 0..arrays {
        let header = extradata.get(pos..pos + 3).ok_or_else(invalid)?;
        let count = usize::from(u16::from_be_bytes([header[1], header[2]]));
        pos += 3;
        for _ in 0..count {
            pos = copy_parameter_set(extradata, pos, &mut out).ok_or_else(invalid)?;
        }
    }
    Ok((out, length_size))
}

fn copy_parameter_set(data: &[u8], pos: usize, out: &mut Vec<u8>) -> Option<usize> {
    let len_bytes = data.get(pos..pos + 2)?;
    let len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
    let nal = data.get(pos + 2..pos + 2 + len)?;
    out.extend_from_slice(START_CODE);
    out.extend_from_slice(nal);
    Some(pos + 2 + len)
}

/// Converts H.264/HEVC from length-prefixed (mp4) to start-code framing and
/// puts the parameter sets from the extradata in front of every key packet.
#[derive(Default)]
pub struct Mp4ToAnnexB {
    parameter_sets: Vec<u8>,
    length_size: usize,
    passthrough: bool,
}

impl BitstreamFilter for Mp4ToAnnexB {
    fn name(&self) -> &'static str {
        "mp4toannexb"
    }

    fn codec_ids(&self) -> &'static [&'static str] {
        &["h264", "hevc"]
    }

    fn init(&mut self, par_out: &mut StreamParams, _time_base_out: &mut Rational) -> Result<()> {
        let extradata = &par_out.extradata;
        if extradata.is_empty() || is_annexb_packet(extradata) {
            log::debug!("mp4toannexb: stream is already annex b, passing through");
            self.passthrough = true;
            return Ok(());
        }
        let (sets, length_size) = if par_out.codec_id == "hevc" {
            parse_hvcc(extradata)?
        } else {
            parse_avcc(extradata)?
        };
        par_out.extradata = sets.clone();
        self.parameter_sets = sets;
        self.length_size = length_size;
        Ok(())
    }

    fn filter(&mut self, input: &mut FilterInput<'_>) -> Result<Received<Packet>> {
        let pkt = match input.get_packet() {
            Received::Unit(pkt) => pkt,
            other => return Ok(other),
        };
        if self.passthrough || is_annexb_packet(pkt.data()) {
            return Ok(Received::Unit(pkt));
        }
        let mut out = BytesMut::with_capacity(pkt.size() + self.parameter_sets.len() + 16);
        if pkt.is_key() {
            out.extend_from_slice(&self.parameter_sets);
        }
        append_length_prefixed(&mut out, pkt.data(), self.length_size.max(1))?;

        let mut filtered = Packet::from_bytes(&out.freeze());
        filtered.copy_props(&pkt);
        Ok(Received::Unit(filtered))
    }
}

/// Splits every packet into pieces of at most `size` bytes.
pub struct ChunkFilter {
    size: usize,
    pending: Option<Packet>,
}

impl ChunkFilter {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("chunk size must be positive".to_string()));
        }
        Ok(Self {
            size,
            pending: None,
        })
    }
}

impl BitstreamFilter for ChunkFilter {
    fn name(&self) -> &'static str {
        "chunk"
    }

    fn filter(&mut self, input: &mut FilterInput<'_>) -> Result<Received<Packet>> {
        let mut pkt = match self.pending.take() {
            Some(pkt) => pkt,
            None => match input.get_packet() {
                Received::Unit(pkt) => pkt,
                other => return Ok(other),
            },
        };
        let head = pkt.split_to(self.size);
        if pkt.size() > 0 {
            self.pending = Some(pkt);
        }
        Ok(Received::Unit(head))
    }

    fn flush(&mut self) {
        self.pending = None;
    }
}
