//! frame_feeder - synthetic camera source for routerd
//!
//! Opens one connection, registers N cameras and streams random payloads for
//! each of them at a fixed rate, with periodic heartbeats.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::RngCore;
use std::net::TcpStream;
use std::time::{Duration, Instant, SystemTime};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use mentat_router::frame::epoch_secs;
use mentat_router::protocol::{self, ClientMessage, ExpertTarget, FrameHeader, FrameMessage};
use mentat_router::CameraId;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Router WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:8765")]
    url: String,
    /// Number of synthetic cameras.
    #[arg(long, default_value_t = 2)]
    cameras: u32,
    /// Frames per second per camera.
    #[arg(long, default_value_t = 15)]
    fps: u32,
    /// Run time in seconds (0 = until interrupted).
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    /// Experts each frame is routed to.
    #[arg(long, value_delimiter = ',', default_value = "motion,frame_info")]
    experts: Vec<String>,
    /// Payload size in bytes.
    #[arg(long, default_value_t = 4096)]
    payload_bytes: usize,
    /// Send frames as binary messages instead of base64 JSON.
    #[arg(long)]
    binary: bool,
    /// Repeat the previous payload this often (0.0-1.0) to simulate a still scene.
    #[arg(long, default_value_t = 0.5)]
    still_ratio: f64,
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

fn send_json(ws: &mut Socket, message: &ClientMessage) -> Result<()> {
    ws.send(Message::text(serde_json::to_string(message)?))?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    if args.cameras == 0 {
        return Err(anyhow!("cameras must be >= 1"));
    }
    if args.experts.is_empty() {
        return Err(anyhow!("at least one expert is required"));
    }

    let (mut ws, _) =
        tungstenite::connect(args.url.as_str()).with_context(|| format!("connect {}", args.url))?;
    log::info!("connected to {}", args.url);

    let cameras: Vec<CameraId> = (0..args.cameras).map(|i| CameraId::from(i as u64)).collect();
    for camera in &cameras {
        send_json(
            &mut ws,
            &ClientMessage::Register {
                camera_id: camera.clone(),
                name: Some(format!("synthetic-{}", camera)),
            },
        )?;
    }

    let mut rng = rand::thread_rng();
    let mut payloads: Vec<Vec<u8>> = cameras
        .iter()
        .map(|_| {
            let mut bytes = vec![0u8; args.payload_bytes.max(1)];
            rng.fill_bytes(&mut bytes);
            bytes
        })
        .collect();
    let target = ExpertTarget::Many(args.experts.clone());

    let tick = Duration::from_secs_f64(1.0 / args.fps as f64);
    let started = Instant::now();
    let mut next = started;
    let mut last_heartbeat = started;
    let mut sent: u64 = 0;
    loop {
        if args.seconds > 0 && started.elapsed() >= Duration::from_secs(args.seconds) {
            break;
        }
        for (camera, payload) in cameras.iter().zip(payloads.iter_mut()) {
            if (rng.next_u32() as f64 / u32::MAX as f64) >= args.still_ratio {
                rng.fill_bytes(payload);
            }
            let capture_time = Some(epoch_secs(SystemTime::now()));
            if args.binary {
                let header = FrameHeader {
                    camera_id: camera.clone(),
                    expert: target.clone(),
                    capture_time,
                };
                ws.send(Message::binary(protocol::encode_binary(&header, payload)?))?;
            } else {
                send_json(
                    &mut ws,
                    &ClientMessage::Frame(FrameMessage {
                        camera_id: camera.clone(),
                        expert: target.clone(),
                        frame: protocol::encode_payload(payload),
                        capture_time,
                    }),
                )?;
            }
            sent += 1;
        }
        if last_heartbeat.elapsed() >= Duration::from_secs(2) {
            for camera in &cameras {
                send_json(
                    &mut ws,
                    &ClientMessage::Heartbeat {
                        camera_id: camera.clone(),
                    },
                )?;
            }
            last_heartbeat = Instant::now();
        }

        next += tick;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }
    }

    send_json(&mut ws, &ClientMessage::GetStats)?;
    loop {
        match ws.read()? {
            Message::Text(text) => {
                let reply: protocol::ServerMessage = serde_json::from_str(text.as_str())?;
                if let protocol::ServerMessage::Stats { stats } = reply {
                    log::info!(
                        "sent {} frames; router processed {} at {:.1} fps aggregate",
                        sent,
                        stats.total_frames_processed,
                        stats.aggregate_fps
                    );
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    let _ = ws.close(None);
    Ok(())
}
