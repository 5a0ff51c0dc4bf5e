//! Detached-socket tunnel mode (§3 "Detached Socket", §4.4 TUNNEL state,
//! §9 "single ownership in the tunnel forwarder pair, with a cancellation
//! token both sides read").

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::frame::{self, BODY_CHUNK_BYTES};
use crate::wire::{self, FrameType, ProtocolVersion};

/// One half of an upgraded connection handed to the handler when it wants
/// to switch a bridge connection into opaque tunnel mode (§3, §4.4, §4.5).
/// Owns `outbound` (bytes flowing from the handler toward whichever peer it
/// represents) and `inbound` (bytes arriving from that peer).
pub struct DetachedSocket {
    pub outbound: Box<dyn AsyncWrite + Send + Unpin>,
    pub inbound: Box<dyn AsyncRead + Send + Unpin>,
}

impl DetachedSocket {
    pub fn new(
        outbound: Box<dyn AsyncWrite + Send + Unpin>,
        inbound: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Forwards bytes bidirectionally between a detached socket and a bridge
/// connection carrying `TUN_CHUNK`/`TUN_CLOSE` frames, until either side
/// closes (§4.4 "Tunnel handoff").
pub async fn run_tunnel<B>(
    detached: DetachedSocket,
    bridge: B,
    version: ProtocolVersion,
) -> Result<(), BridgeError>
where
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (bridge_reader, bridge_writer) = tokio::io::split(bridge);
    let DetachedSocket { outbound, inbound } = detached;
    let cancel = CancellationToken::new();

    let to_bridge = tokio::spawn(forward_to_bridge(
        inbound,
        bridge_writer,
        version,
        cancel.clone(),
    ));
    let to_socket = tokio::spawn(forward_to_socket(bridge_reader, outbound, cancel.clone()));

    let (to_bridge_result, to_socket_result) = tokio::join!(to_bridge, to_socket);

    to_bridge_result.map_err(|error| BridgeError::Tunnel(format!("forward-to-bridge task failed: {error}")))??;
    to_socket_result.map_err(|error| BridgeError::Tunnel(format!("forward-to-socket task failed: {error}")))??;
    Ok(())
}

async fn forward_to_bridge<R, W>(
    mut inbound: R,
    mut bridge_writer: W,
    version: ProtocolVersion,
    cancel: CancellationToken,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0_u8; BODY_CHUNK_BYTES];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = inbound.read(&mut buffer) => read?,
        };
        if read == 0 {
            let payload = wire::encode_tunnel_close(version);
            frame::write_frame(&mut bridge_writer, &payload).await?;
            cancel.cancel();
            return Ok(());
        }
        let payload = wire::encode_chunk_payload(version, FrameType::TunChunk, &buffer[..read])?;
        frame::write_frame(&mut bridge_writer, &payload).await?;
    }
}

async fn forward_to_socket<R, W>(
    mut bridge_reader: R,
    mut outbound: W,
    cancel: CancellationToken,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            payload = frame::read_frame(&mut bridge_reader) => payload?,
        };
        let Some(payload) = payload else {
            cancel.cancel();
            return Ok(());
        };
        let frame_type = wire::peek_frame_type(&payload)?;
        match frame_type {
            FrameType::TunChunk => {
                let chunk = wire::decode_chunk(&payload, FrameType::TunChunk)?;
                if !chunk.is_empty() {
                    outbound.write_all(chunk).await?;
                }
            }
            FrameType::TunClose => {
                wire::decode_end(&payload, FrameType::TunClose)?;
                cancel.cancel();
                return Ok(());
            }
            other => {
                return Err(BridgeError::Tunnel(format!(
                    "unexpected frame type in tunnel mode: {other:?}"
                )));
            }
        }
    }
}
