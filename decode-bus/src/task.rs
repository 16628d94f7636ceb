use std::pin::Pin;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::decoder::{Decoder, Pull};
use crate::frame::{Frame, FrameCmd, FrameReceiver, FrameSender};
use crate::packet::{PacketCmd, PacketReceiver, Sent};

/// `None` marks the end of the stream.
pub type FrameStream = Pin<Box<dyn Stream<Item = Option<Frame>> + Send>>;

/// Runs a [`Decoder`] on a blocking thread, fed from a channel of packets,
/// and broadcasts the decoded frames.
pub struct DecodeTask {
    cancel: CancellationToken,
    frame_chan: FrameSender,
}

impl Default for DecodeTask {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeTask {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        let (sender, _) = tokio::sync::broadcast::channel(1024);

        Self {
            cancel,
            frame_chan: sender,
        }
    }

    pub fn subscribe(&self) -> FrameReceiver {
        self.frame_chan.subscribe()
    }

    /// Frames as a stream. Subscribe before [`DecodeTask::start`] to see every
    /// frame.
    pub fn stream(&self) -> FrameStream {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|cmd| async move {
            match cmd {
                Ok(FrameCmd::Data(frame)) => Some(Some(frame)),
                Ok(FrameCmd::Eof) => Some(None),
                Err(e) => {
                    log::error!("decode task output lagged: {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn start<C: Codec>(&self, decoder: Decoder<C>, mut packet_receiver: PacketReceiver) {
        let cancel_clone = self.cancel.clone();
        let sender_clone = self.frame_chan.clone();
        tokio::spawn(async move {
            let (packet_tx, packet_rx) = std::sync::mpsc::channel::<PacketCmd>();

            let handle_cancel = cancel_clone.clone();
            let handle = tokio::task::spawn_blocking(move || {
                Self::decode_loop(decoder, handle_cancel, packet_rx, sender_clone)
            });
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        break;
                    }
                    cmd = packet_receiver.recv() => {
                        match cmd {
                            Some(PacketCmd::Data(packet)) => {
                                let _ = packet_tx.send(PacketCmd::Data(packet));
                            }
                            Some(PacketCmd::Eof) | None => {
                                let _ = packet_tx.send(PacketCmd::Eof);
                                break;
                            }
                        }
                    }
                }
            }
            if let Err(e) = handle.await {
                log::error!("decode loop join error: {}", e);
            }
        });
    }

    fn decode_loop<C: Codec>(
        mut decoder: Decoder<C>,
        cancel: CancellationToken,
        packet_rx: std::sync::mpsc::Receiver<PacketCmd>,
        out_sender: FrameSender,
    ) {
        'outer: loop {
            if cancel.is_cancelled() {
                break;
            }
            let mut pending = match packet_rx.recv_timeout(Duration::from_millis(1)) {
                Ok(PacketCmd::Data(packet)) => Some(packet),
                Ok(PacketCmd::Eof) | Err(RecvTimeoutError::Disconnected) => None,
                Err(RecvTimeoutError::Timeout) => continue,
            };
            let eof = pending.is_none();

            loop {
                match decoder.send_packet(pending.take()) {
                    Ok(Sent::Accepted) => {}
                    Ok(Sent::WouldBlock(packet)) => pending = Some(packet),
                    Err(e) => log::error!("send packet error: {}", e),
                }
                if Self::forward_frames(&mut decoder, &out_sender) || eof {
                    break 'outer;
                }
                if pending.is_none() {
                    break;
                }
            }
        }

        log::info!("decode task finished after {} frames", decoder.frame_num());
        let _ = out_sender.send(FrameCmd::Eof);
        if let Err(e) = decoder.close() {
            log::error!("decoder close error: {}", e);
        }
    }

    /// Pulls until the decoder wants more input. True once the stream ended.
    fn forward_frames<C: Codec>(decoder: &mut Decoder<C>, out_sender: &FrameSender) -> bool {
        loop {
            match decoder.pull_output() {
                Ok(Pull::Frame(frame)) => {
                    let _ = out_sender.send(FrameCmd::Data(frame));
                }
                Ok(Pull::NeedMore) => return false,
                Ok(Pull::Eof) => return true,
                Err(e) if e.is_fatal() => {
                    log::error!("receive frame error: {}", e);
                    return true;
                }
                Err(e) => log::warn!("receive frame error: {}", e),
            }
        }
    }
}
