use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use proptest::prelude::*;
use rand::Rng;

use crate::accel::{AccelDescriptor, AsyncLock};
use crate::codec::{Codec, CodecCaps, CodecContext, CodecKind, DecodeOutcome, PacketSource};
use crate::decode::UserFields;
use crate::error::{Error, Received, Result};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::scheduler::FrameThreads;
use crate::slot::{Slot, SlotState};
use crate::stream::{Rational, StreamParams};

#[derive(Default)]
struct QueueSource {
    packets: VecDeque<Packet>,
    eof: bool,
}

impl QueueSource {
    fn numbered(n: usize) -> Self {
        let mut src = Self::default();
        src.push_range(0..n as i64);
        src.eof = true;
        src
    }

    fn push_range(&mut self, range: std::ops::Range<i64>) {
        for pts in range {
            self.packets
                .push_back(Packet::from_vec(pts.to_le_bytes().to_vec()).with_pts(pts));
        }
    }
}

impl PacketSource for QueueSource {
    fn get_packet(&mut self) -> Result<Received<Packet>> {
        Ok(match self.packets.pop_front() {
            Some(pkt) => Received::Unit(pkt),
            None if self.eof => Received::Eof,
            None => Received::NeedInput,
        })
    }
}

#[derive(Default)]
struct Tracker {
    /// (pts, counter value after increment) in decode order
    seen: Mutex<Vec<(i64, u64)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    slept_us: AtomicU64,
}

/// One frame per packet. Keeps a counter that is carried from thread to
/// thread through the forwarded state.
struct Counting {
    tracker: Arc<Tracker>,
    finish_early: bool,
    max_sleep_us: u64,
    fail_on: Option<i64>,
    panic_on: Option<i64>,
    /// Counter value whose export blows up.
    panic_on_export: Option<u64>,
}

impl Counting {
    fn new(tracker: &Arc<Tracker>) -> Self {
        Self {
            tracker: Arc::clone(tracker),
            finish_early: true,
            max_sleep_us: 0,
            fail_on: None,
            panic_on: None,
            panic_on_export: None,
        }
    }
}

impl Codec for Counting {
    type Context = u64;
    type Forward = u64;

    fn name(&self) -> &'static str {
        "counting"
    }

    fn caps(&self) -> CodecCaps {
        CodecCaps {
            update_thread_context: true,
            ..CodecCaps::default()
        }
    }

    fn init(&self, _params: &StreamParams) -> Result<u64> {
        Ok(0)
    }

    fn fork(&self, canonical: &u64) -> Result<u64> {
        Ok(*canonical)
    }

    fn export_forward(&self, ctx: &u64) -> u64 {
        if self.panic_on_export == Some(*ctx) {
            panic!("cannot export counter {}", ctx);
        }
        *ctx
    }

    fn update_thread_context(&self, dst: &mut CodecContext<Self>, src: &u64) -> Result<()> {
        dst.priv_data = *src;
        Ok(())
    }

    fn decode(&self, ctx: &mut CodecContext<Self>, pkt: &Packet, frame: &mut Frame) -> Result<DecodeOutcome> {
        let pts = pkt.pts.unwrap_or(-1);
        if self.panic_on == Some(pts) {
            panic!("bad unit {}", pts);
        }

        let now = self.tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.max_active.fetch_max(now, Ordering::SeqCst);

        ctx.priv_data += 1;
        self.tracker.seen.lock().push((pts, ctx.priv_data));
        if let Some(accel) = ctx.accel_mut() {
            accel.frames_decoded += 1;
        }
        if self.finish_early {
            ctx.finish_setup();
        }

        if self.max_sleep_us > 0 {
            let us = rand::thread_rng().gen_range(0..=self.max_sleep_us);
            self.tracker.slept_us.fetch_add(us, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(us));
        }

        let result = if self.fail_on == Some(pts) {
            Err(Error::Decode(format!("corrupt unit {}", pts)))
        } else {
            ctx.get_buffer(frame, pkt.size())
                .and_then(|_| frame.buf.data_mut().map(|d| d.copy_from_slice(pkt.data())))
                .map(|_| DecodeOutcome::frame(pkt.size()))
        };
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct GateState {
    open: bool,
    entered: usize,
}

/// Holds decode calls until opened.
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut st = self.state.lock();
        st.entered += 1;
        self.cond.notify_all();
        while !st.open {
            self.cond.wait(&mut st);
        }
    }

    fn wait_entered(&self, n: usize) {
        let mut st = self.state.lock();
        while st.entered < n {
            self.cond.wait(&mut st);
        }
    }

    fn open(&self) {
        self.state.lock().open = true;
        self.cond.notify_all();
    }
}

/// Blocks every decode call until the gate opens.
struct Gated {
    gate: Arc<Gate>,
}

impl Codec for Gated {
    type Context = ();
    type Forward = ();

    fn name(&self) -> &'static str {
        "gated"
    }

    fn init(&self, _params: &StreamParams) -> Result<()> {
        Ok(())
    }

    fn fork(&self, _canonical: &()) -> Result<()> {
        Ok(())
    }

    fn export_forward(&self, _ctx: &()) {}

    fn decode(&self, _ctx: &mut CodecContext<Self>, pkt: &Packet, frame: &mut Frame) -> Result<DecodeOutcome> {
        self.gate.pass();
        frame.buf = pkt.buffer().ref_buffer();
        Ok(DecodeOutcome::frame(pkt.size()))
    }
}

/// Pull-style codec returning one frame per packet pulled.
struct Pulling;

impl Codec for Pulling {
    type Context = ();
    type Forward = ();

    fn name(&self) -> &'static str {
        "pulling"
    }

    fn caps(&self) -> CodecCaps {
        CodecCaps {
            kind: CodecKind::ReceiveFrame,
            ..CodecCaps::default()
        }
    }

    fn init(&self, _params: &StreamParams) -> Result<()> {
        Ok(())
    }

    fn fork(&self, _canonical: &()) -> Result<()> {
        Ok(())
    }

    fn export_forward(&self, _ctx: &()) {}

    fn receive_frame(&self, ctx: &mut CodecContext<Self>, src: &mut dyn PacketSource) -> Result<Received<Frame>> {
        Ok(match ctx.get_packet(src)? {
            Received::Unit(pkt) => {
                let mut frame = Frame::new();
                frame.buf = pkt.buffer().ref_buffer();
                frame.pts = pkt.pts;
                Received::Unit(frame)
            }
            Received::NeedInput => Received::NeedInput,
            Received::Eof => Received::Eof,
        })
    }
}

fn params() -> StreamParams {
    StreamParams::video("raw", 4, 2, Rational::new(1, 90000))
}

fn start<C: Codec>(codec: C, threads: usize, accel: Option<&AccelDescriptor>) -> anyhow::Result<FrameThreads<C>> {
    let params = params();
    let canonical = codec.init(&params)?;
    Ok(FrameThreads::new(Arc::new(codec), &params, &canonical, threads, accel)?)
}

/// Pulls until end of stream. Errors are recorded in place of a frame.
fn drain<C: Codec>(ft: &mut FrameThreads<C>, src: &mut QueueSource) -> Vec<std::result::Result<i64, Error>> {
    let mut out = Vec::new();
    loop {
        match ft.receive_frame(src) {
            Ok(Received::Unit(frame)) => out.push(Ok(frame.pts.unwrap_or(-1))),
            Ok(Received::NeedInput) => panic!("source was closed, decoder asked for more"),
            Ok(Received::Eof) => return out,
            Err(e) => out.push(Err(e)),
        }
    }
}

fn pts_only(out: Vec<std::result::Result<i64, Error>>) -> anyhow::Result<Vec<i64>> {
    out.into_iter().map(|r| r.map_err(anyhow::Error::from)).collect()
}

#[test]
fn test_output_keeps_submission_order() -> anyhow::Result<()> {
    for threads in [2, 4, 8] {
        let tracker = Arc::new(Tracker::default());
        let mut codec = Counting::new(&tracker);
        codec.max_sleep_us = 300;
        let mut ft = start(codec, threads, None)?;

        let mut src = QueueSource::numbered(100);
        let pts = pts_only(drain(&mut ft, &mut src))?;
        assert_eq!(pts, (0..100).collect::<Vec<_>>(), "threads={}", threads);
    }
    Ok(())
}

#[test]
fn test_frame_payload_matches_packet() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut ft = start(Counting::new(&tracker), 3, None)?;
    let mut src = QueueSource::numbered(7);
    let mut seen = 0;
    while let Received::Unit(frame) = ft.receive_frame(&mut src)? {
        let pts = frame.pts.unwrap_or(-1);
        assert_eq!(frame.data(), &pts.to_le_bytes());
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.pkt_dts, Some(pts));
        seen += 1;
    }
    assert_eq!(seen, 7);
    Ok(())
}

#[test]
fn test_forwarded_state_is_causal() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut codec = Counting::new(&tracker);
    codec.max_sleep_us = 500;
    let mut ft = start(codec, 4, None)?;
    let mut src = QueueSource::numbered(64);
    let pts = pts_only(drain(&mut ft, &mut src))?;
    assert_eq!(pts.len(), 64);

    let mut seen = tracker.seen.lock().clone();
    seen.sort_by_key(|(pts, _)| *pts);
    for (pts, count) in seen {
        assert_eq!(count, pts as u64 + 1, "unit {} saw a stale counter", pts);
    }
    Ok(())
}

#[test]
fn test_late_finalize_still_causal() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut codec = Counting::new(&tracker);
    codec.finish_early = false;
    let mut ft = start(codec, 4, None)?;
    let mut src = QueueSource::numbered(20);
    assert_eq!(pts_only(drain(&mut ft, &mut src))?, (0..20).collect::<Vec<_>>());
    let counts: Vec<_> = tracker.seen.lock().iter().map(|(_, c)| *c).collect();
    assert_eq!(counts, (1..=20).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_eof_is_terminal() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut ft = start(Counting::new(&tracker), 4, None)?;
    let mut src = QueueSource::numbered(3);
    assert_eq!(pts_only(drain(&mut ft, &mut src))?, vec![0, 1, 2]);
    for _ in 0..10 {
        assert!(ft.receive_frame(&mut src)?.is_eof());
    }
    Ok(())
}

#[test]
fn test_empty_stream() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut ft = start(Counting::new(&tracker), 2, None)?;
    let mut src = QueueSource::numbered(0);
    assert!(ft.receive_frame(&mut src)?.is_eof());
    Ok(())
}

#[test]
fn test_need_input_before_threads_are_full() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut ft = start(Counting::new(&tracker), 4, None)?;
    let mut src = QueueSource::default();
    src.push_range(0..3);
    assert!(matches!(ft.receive_frame(&mut src)?, Received::NeedInput));
    assert!(src.packets.is_empty());

    src.push_range(3..4);
    assert_eq!(ft.receive_frame(&mut src)?.unit().and_then(|f| f.pts), Some(0));
    Ok(())
}

#[test]
fn test_decode_error_surfaces_once() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut codec = Counting::new(&tracker);
    codec.fail_on = Some(5);
    let mut ft = start(codec, 4, None)?;
    let mut src = QueueSource::numbered(10);
    let out = drain(&mut ft, &mut src);

    assert_eq!(out.len(), 10);
    assert!(matches!(out[5], Err(Error::Decode(_))));
    let good: Vec<_> = out.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(good, vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);
    Ok(())
}

#[test]
fn test_worker_panic_is_contained() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut codec = Counting::new(&tracker);
    codec.panic_on = Some(2);
    let mut ft = start(codec, 2, None)?;
    let mut src = QueueSource::numbered(6);
    let out = drain(&mut ft, &mut src);

    let broken: Vec<_> = out.iter().filter(|r| matches!(r, Err(e) if e.is_invariant_broken())).collect();
    assert_eq!(broken.len(), 1);
    let good: Vec<_> = out.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(good, vec![0, 1, 3, 4, 5]);
    assert!(ft.teardown().is_ok());
    Ok(())
}

#[test]
fn test_panic_while_finalizing_is_contained() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut codec = Counting::new(&tracker);
    // every thread reaches a counter of 1 on its first unit, as nothing is
    // published by the thread before it
    codec.panic_on_export = Some(1);
    let mut ft = start(codec, 2, None)?;

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let mut src = QueueSource::numbered(6);
        let out = drain(&mut ft, &mut src);
        let _ = tx.send((out, ft.teardown().is_ok()));
    });
    let (out, torn_down) = rx
        .recv_timeout(Duration::from_secs(10))
        .map_err(|_| anyhow::anyhow!("decode hung after a panic in finish_setup"))?;

    let broken = out.iter().filter(|r| matches!(r, Err(e) if e.is_invariant_broken())).count();
    assert_eq!(broken, 2);
    let good: Vec<_> = out.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(good, vec![2, 3, 4, 5]);
    assert!(torn_down);
    Ok(())
}

#[test]
fn test_pull_codec_in_threads() -> anyhow::Result<()> {
    let mut ft = start(Pulling, 3, None)?;
    let mut src = QueueSource::numbered(10);
    assert_eq!(pts_only(drain(&mut ft, &mut src))?, (0..10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_flush_drops_in_flight_and_keeps_state() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut ft = start(Counting::new(&tracker), 4, None)?;

    let mut src = QueueSource::default();
    src.push_range(0..6);
    let mut early = Vec::new();
    while let Received::Unit(frame) = ft.receive_frame(&mut src)? {
        early.extend(frame.pts);
    }
    assert_eq!(early, vec![0, 1, 2]);

    ft.flush()?;
    assert!(ft.slot_states().iter().all(|s| *s == SlotState::Ready));

    let mut src = QueueSource::default();
    src.push_range(100..104);
    src.eof = true;
    assert_eq!(pts_only(drain(&mut ft, &mut src))?, vec![100, 101, 102, 103]);

    // the first unit after the flush continues from the last unit decoded
    let seen = tracker.seen.lock().clone();
    let after = seen.iter().find(|(pts, _)| *pts == 100).map(|(_, c)| *c);
    assert_eq!(after, Some(7));
    Ok(())
}

#[test]
fn test_flush_clears_draining() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut ft = start(Counting::new(&tracker), 2, None)?;
    let mut src = QueueSource::numbered(2);
    drain(&mut ft, &mut src);
    assert!(ft.is_draining());

    ft.flush()?;
    assert!(!ft.is_draining());
    let mut src = QueueSource::numbered(3);
    assert_eq!(pts_only(drain(&mut ft, &mut src))?, vec![0, 1, 2]);
    Ok(())
}

#[test]
fn test_serial_accel_never_overlaps() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut codec = Counting::new(&tracker);
    codec.max_sleep_us = 200;
    let desc = AccelDescriptor::new("raw_serial", false, true);
    let mut ft = start(codec, 8, Some(&desc))?;

    let mut src = QueueSource::numbered(200);
    assert_eq!(pts_only(drain(&mut ft, &mut src))?.len(), 200);
    assert_eq!(tracker.max_active.load(Ordering::SeqCst), 1);

    let state = ft.teardown()?.ok_or_else(|| anyhow::anyhow!("no accelerator state returned"))?;
    assert_eq!(state.descriptor.name, "raw_serial");
    assert_eq!(state.frames_decoded, 200);
    Ok(())
}

#[test]
fn test_thread_safe_accel_is_forked() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let desc = AccelDescriptor::new("raw_parallel", true, true);
    let mut ft = start(Counting::new(&tracker), 4, Some(&desc))?;
    let mut src = QueueSource::default();
    src.push_range(0..12);
    let mut pulled = 0;
    while let Received::Unit(_) = ft.receive_frame(&mut src)? {
        pulled += 1;
    }
    assert_eq!(pulled, 9);

    // each thread carries forward the state of the one before it
    let state = ft.teardown()?.ok_or_else(|| anyhow::anyhow!("no accelerator state returned"))?;
    assert_eq!(state.frames_decoded, 12);
    assert!(state.forks > 1);
    Ok(())
}

#[test]
fn test_async_unsafe_accel_does_not_starve() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut codec = Counting::new(&tracker);
    codec.max_sleep_us = 100;
    let desc = AccelDescriptor::new("raw_async", true, false);
    let mut ft = start(codec, 4, Some(&desc))?;
    let mut src = QueueSource::numbered(40);
    assert_eq!(pts_only(drain(&mut ft, &mut src))?, (0..40).collect::<Vec<_>>());
    ft.flush()?;
    Ok(())
}

#[test]
fn test_stress_runs_in_parallel() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut codec = Counting::new(&tracker);
    codec.max_sleep_us = 2000;
    let mut ft = start(codec, 8, None)?;

    let started = Instant::now();
    let mut src = QueueSource::numbered(10_000);
    let pts = pts_only(drain(&mut ft, &mut src))?;
    let wall = started.elapsed();

    assert_eq!(pts, (0..10_000).collect::<Vec<_>>());
    let sequential = Duration::from_micros(tracker.slept_us.load(Ordering::SeqCst));
    assert!(
        wall < sequential,
        "wall time {:?} not below sequential sleep time {:?}",
        wall,
        sequential
    );
    assert!(tracker.max_active.load(Ordering::SeqCst) > 1);
    Ok(())
}

#[test]
fn test_needs_two_threads() {
    let tracker = Arc::new(Tracker::default());
    assert!(matches!(
        start(Counting::new(&tracker), 1, None).err().and_then(|e| e.downcast::<Error>().ok()),
        Some(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_use_after_teardown() -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::default());
    let mut ft = start(Counting::new(&tracker), 2, None)?;
    assert!(ft.teardown()?.is_none());
    assert!(ft.teardown()?.is_none());
    let mut src = QueueSource::numbered(1);
    assert!(matches!(ft.receive_frame(&mut src), Err(Error::ContractViolation(_))));
    Ok(())
}

#[test]
fn test_submit_to_busy_slot() -> anyhow::Result<()> {
    let gate = Arc::new(Gate::default());
    let codec = Arc::new(Gated { gate: Arc::clone(&gate) });
    let ctx = CodecContext::new(Arc::clone(&codec), (), params());
    let slot = Arc::new(Slot::spawn(0, ctx, Arc::new(AsyncLock::new(false)))?);

    let user = UserFields::default();
    slot.submit(Packet::from_vec(vec![1]).with_pts(1), &user, None)?;
    // the worker now sits inside decode holding the context lock
    gate.wait_entered(1);
    assert_ne!(slot.state(), SlotState::Ready);

    let (tx, rx) = std::sync::mpsc::channel();
    let busy = Arc::clone(&slot);
    std::thread::spawn(move || {
        let res = busy.submit(Packet::from_vec(vec![2]).with_pts(2), &UserFields::default(), None);
        drop(busy);
        let _ = tx.send(res);
    });
    let second = rx.recv_timeout(Duration::from_secs(5));
    gate.open();
    let second = second.map_err(|_| anyhow::anyhow!("second submit blocked on a busy thread"))?;
    assert!(matches!(second, Err(Error::ContractViolation(_))));

    slot.wait_ready();
    let (frames, _) = slot.collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].pts, Some(1));
    let mut slot = Arc::try_unwrap(slot).map_err(|_| anyhow::anyhow!("slot still shared"))?;
    slot.stop()?;
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_one_frame_per_unit(n in 0usize..48, threads in 2usize..9) {
        let tracker = Arc::new(Tracker::default());
        let mut ft = start(Counting::new(&tracker), threads, None)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let mut src = QueueSource::numbered(n);
        let pts = pts_only(drain(&mut ft, &mut src))
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(pts, (0..n as i64).collect::<Vec<_>>());
    }
}
