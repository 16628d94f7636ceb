use std::time::Instant;

use bytes::Bytes;
use decode_bus::codecs::raw::RawDecoder;
use decode_bus::task::DecodeTask;
use decode_bus::{Decoder, DecoderConfig, Packet, PacketCmd, Rational, Registry, StreamParams};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 36;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("decode_bus", log::LevelFilter::Debug)
        .init();
}

/// Usage: `frame-sched [config.json] [packet_count]`
async fn run(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>().into_iter();
    let config = match args.next() {
        Some(path) => DecoderConfig::from_path(&path)?,
        None => DecoderConfig::default(),
    };
    let count: i64 = match args.next() {
        Some(n) => n.parse()?,
        None => 1000,
    };
    log::info!("config: {}", serde_json::to_string(&config)?);

    let params = StreamParams::video("raw", WIDTH, HEIGHT, Rational::new(1, 90000));
    let decoder = Decoder::new(&config, RawDecoder::default(), params, &Registry::with_builtins())?;
    log::info!(
        "decoding {} synthetic packets on {} thread(s)",
        count,
        decoder.thread_count()
    );

    let task = DecodeTask::new();
    let mut frames = task.stream();
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    task.start(decoder, rx).await;

    let payload = Bytes::from(vec![0x5a; (WIDTH * HEIGHT * 3 / 2) as usize]);
    let feeder = tokio::spawn(async move {
        for i in 0..count {
            let packet = Packet::from_bytes(&payload)
                .with_pts(i * 3600)
                .with_key(i % 30 == 0);
            if tx.send(PacketCmd::Data(packet)).await.is_err() {
                return;
            }
        }
        let _ = tx.send(PacketCmd::Eof).await;
    });

    let started = Instant::now();
    let mut decoded = 0u64;
    let mut last_pts = None;
    let mut position_ms = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                task.stop();
                break;
            }
            frame = frames.next() => match frame {
                Some(Some(frame)) => {
                    if frame.pts <= last_pts {
                        anyhow::bail!("frame {:?} out of order after {:?}", frame.pts, last_pts);
                    }
                    last_pts = frame.pts;
                    position_ms = frame.pts_ms().unwrap_or(position_ms);
                    decoded += 1;
                }
                Some(None) | None => break,
            }
        }
    }
    feeder.abort();

    let elapsed = started.elapsed();
    log::info!(
        "decoded {} frames up to {} ms of stream in {:?} ({:.1} fps)",
        decoded,
        position_ms,
        elapsed,
        decoded as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ! {
    init_logging();

    let cancel = CancellationToken::new();
    let mut handle = tokio::spawn(run(cancel.clone()));

    let code = loop {
        tokio::select! {
            res = &mut handle => {
                break match res {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => {
                        log::error!("{:#}", e);
                        1
                    }
                    Err(e) => {
                        log::error!("decode run failed: {}", e);
                        1
                    }
                };
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    };

    std::process::exit(code);
}
