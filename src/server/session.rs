use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tungstenite::{Message, WebSocket};

use super::ServerConfig;
use crate::aggregate::CameraState;
use crate::error::RouterError;
use crate::frame::CameraId;
use crate::protocol::{self, ClientMessage, FrameRequest, ServerMessage};
use crate::publish::SubscriberId;
use crate::router::Router;

/// One WebSocket connection.
pub struct Session {
    router: Arc<Router>,
    cfg: ServerConfig,
    shutdown: Arc<AtomicBool>,
    /// Cameras this connection has sent frames, heartbeats or registrations for.
    cameras: BTreeSet<CameraId>,
    subscriber: Option<(SubscriberId, Receiver<Arc<CameraState>>)>,
}

impl Session {
    pub fn new(router: Arc<Router>, cfg: ServerConfig, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            router,
            cfg,
            shutdown,
            cameras: BTreeSet::new(),
            subscriber: None,
        }
    }

    pub fn run(mut self, stream: TcpStream, peer: SocketAddr) {
        log::debug!("session {} opened", peer);
        if let Err(err) = self.serve(stream, peer) {
            log::warn!("session {} ended: {}", peer, err);
        }
        self.cleanup(peer);
    }

    fn serve(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.cfg.handshake_timeout))?;
        let mut ws = tungstenite::accept(stream)
            .map_err(|e| anyhow!("websocket handshake with {} failed: {}", peer, e))?;
        ws.get_ref().set_read_timeout(Some(self.cfg.session_poll))?;
        ws.get_ref().set_write_timeout(Some(self.cfg.write_timeout))?;

        loop {
            if self.shutdown.load(Ordering::SeqCst) || self.router.is_shut_down() {
                let _ = ws.close(None);
                let _ = ws.flush();
                return Ok(());
            }
            self.drain_pushes(&mut ws)?;
            match ws.read() {
                Ok(Message::Text(text)) => {
                    let reply = self.handle_text(text.as_str());
                    if let Some(reply) = reply {
                        self.send(&mut ws, &reply)?;
                    }
                }
                Ok(Message::Binary(bytes)) => {
                    let reply = match protocol::decode_binary(&bytes) {
                        Ok(request) => self.handle_frame(request),
                        Err(err) => Some(self.malformed(err)),
                    };
                    if let Some(reply) = reply {
                        self.send(&mut ws, &reply)?;
                    }
                }
                Ok(Message::Close(_)) => return Ok(()),
                Ok(_) => {}
                Err(tungstenite::Error::Io(err)) if stalled(&err) => {
                    // Flush pending control frames such as pongs.
                    match ws.flush() {
                        Ok(()) => {}
                        Err(tungstenite::Error::Io(err)) if stalled(&err) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    return Ok(())
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn drain_pushes(&mut self, ws: &mut WebSocket<TcpStream>) -> Result<()> {
        let Some((id, rx)) = &self.subscriber else {
            return Ok(());
        };
        let id = *id;
        let mut pushes = Vec::new();
        let mut dropped = false;
        loop {
            match rx.try_recv() {
                Ok(state) => pushes.push(state),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    dropped = true;
                    break;
                }
            }
        }
        for state in pushes {
            self.send(
                ws,
                &ServerMessage::CameraState {
                    state: state.as_ref().clone(),
                },
            )?;
        }
        if dropped {
            self.subscriber = None;
            self.send(
                ws,
                &ServerMessage::error(&RouterError::SubscriberUnreachable(id)),
            )?;
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match protocol::decode_text(text) {
            Ok(message) => self.handle_message(message),
            Err(err) => Some(self.malformed(err)),
        }
    }

    fn malformed(&self, err: RouterError) -> ServerMessage {
        log::warn!("dropping message: {}", err);
        ServerMessage::error(&err)
    }

    fn handle_frame(&mut self, request: FrameRequest) -> Option<ServerMessage> {
        let camera = request.frame.camera_id().clone();
        let result = self.router.submit_frame_to(&request.experts, request.frame);
        self.cameras.insert(camera);
        result.err().map(|err| ServerMessage::error(&err))
    }

    fn handle_message(&mut self, message: ClientMessage) -> Option<ServerMessage> {
        let op = message.op();
        let result = match message {
            ClientMessage::Frame(frame) => {
                return match frame.into_request() {
                    Ok(request) => self.handle_frame(request),
                    Err(err) => Some(self.malformed(err)),
                };
            }
            ClientMessage::Heartbeat { camera_id } => {
                let result = self.router.heartbeat(&camera_id);
                self.cameras.insert(camera_id);
                return result.err().map(|err| ServerMessage::error(&err));
            }
            ClientMessage::Register { camera_id, name } => {
                let result = self.router.register_camera(&camera_id, name);
                self.cameras.insert(camera_id);
                result.map(|()| ServerMessage::ack(op))
            }
            ClientMessage::Subscribe { camera_id } => self
                .subscriber_id()
                .and_then(|id| self.router.subscribe(id, &camera_id))
                .map(|()| ServerMessage::ack(op)),
            ClientMessage::Unsubscribe { camera_id } => match &self.subscriber {
                Some((id, _)) => self
                    .router
                    .unsubscribe(*id, &camera_id)
                    .map(|_| ServerMessage::ack(op)),
                None => Ok(ServerMessage::ack(op)),
            },
            ClientMessage::ListCameras => Ok(ServerMessage::Cameras {
                camera_ids: self.router.list_cameras(),
            }),
            ClientMessage::GetCameraState { camera_id } => self
                .router
                .get_camera_state(&camera_id)
                .map(|state| ServerMessage::CameraState { state }),
            ClientMessage::SnapshotAll => Ok(ServerMessage::Snapshot {
                states: self.router.snapshot_all(),
            }),
            ClientMessage::GetLatestFrame { camera_id } => self
                .router
                .latest_frame(&camera_id)
                .map(|(frame, state)| ServerMessage::latest_frame(&frame, state)),
            ClientMessage::GetStats => Ok(ServerMessage::Stats {
                stats: self.router.get_stats(),
            }),
            ClientMessage::SetExpertEnabled { expert, enabled } => self
                .router
                .set_expert_enabled(&expert, enabled)
                .map(|()| ServerMessage::ack(op)),
            ClientMessage::SetProcessingScale { value } => self
                .router
                .set_processing_scale(value)
                .map(|value| ServerMessage::ProcessingScale { value }),
            ClientMessage::GetProcessingScale => Ok(ServerMessage::ProcessingScale {
                value: self.router.processing_scale(),
            }),
        };
        Some(result.unwrap_or_else(|err| ServerMessage::error(&err)))
    }

    fn subscriber_id(&mut self) -> Result<SubscriberId, RouterError> {
        if let Some((id, _)) = &self.subscriber {
            return Ok(*id);
        }
        let (id, rx) = self.router.open_subscriber("websocket")?;
        self.subscriber = Some((id, rx));
        Ok(id)
    }

    /// Send one message. A peer that stops reading ends the session once the
    /// socket's write timeout expires.
    fn send(&self, ws: &mut WebSocket<TcpStream>, message: &ServerMessage) -> Result<()> {
        let json = message.to_json()?;
        match ws.send(Message::text(json)) {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::Io(err)) if stalled(&err) => Err(match &self.subscriber {
                Some((id, _)) => RouterError::SubscriberUnreachable(*id).into(),
                None => anyhow!("peer stopped reading: {}", err),
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn cleanup(&mut self, peer: SocketAddr) {
        if let Some((id, _)) = self.subscriber.take() {
            self.router.close_subscriber(id);
        }
        for camera in std::mem::take(&mut self.cameras) {
            self.router.disconnect_camera(&camera);
        }
        log::debug!("session {} closed", peer);
    }
}

fn stalled(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
