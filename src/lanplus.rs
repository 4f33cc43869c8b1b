use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;

use crate::crypto::SecretBytes;
use crate::error::{Error, Result};
use crate::protocol::{
    Frame, ProtocolVariant, decode_frame, encode_frame, encode_frame_authenticated, payload_type,
};
use crate::session::PrivilegeLevel;

/// Default reply timeout for client exchanges.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Client-role RMCP+ transport.
///
/// Frame-level send/receive is fully implemented: session-secured framing,
/// little-endian ids and sequences, and trailing auth codes. Session
/// establishment stops after the open-session request; the RAKP exchange is
/// not implemented, so `establish` always reports the capability gap.
pub struct LanPlusClient {
    socket: UdpSocket,
    console_session_id: u32,
    bmc_session_id: u32,
    outbound_seq: u32,
    secret: Option<SecretBytes>,
    established: bool,
}

impl LanPlusClient {
    /// Connect a client socket to `target`.
    pub async fn connect(target: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(target).await?;

        // Nonzero random console-side session id.
        let console_session_id = loop {
            let id = rand::rng().next_u32();
            if id != 0 {
                break id;
            }
        };

        Ok(Self {
            socket,
            console_session_id,
            bmc_session_id: 0,
            outbound_seq: 0,
            secret: None,
            established: false,
        })
    }

    /// Console-side session id chosen at connect time.
    pub fn console_session_id(&self) -> u32 {
        self.console_session_id
    }

    /// Send a session-secured frame, authenticated when a secret is set.
    pub async fn send_frame(&mut self, payload_type: u8, payload: Vec<u8>) -> Result<()> {
        self.outbound_seq = self.outbound_seq.wrapping_add(1);
        let frame = Frame::secured(
            payload_type,
            self.bmc_session_id,
            self.outbound_seq,
            payload,
        );

        let bytes = match &self.secret {
            Some(secret) => encode_frame_authenticated(&frame, secret)?,
            None => encode_frame(&frame)?,
        };
        self.socket.send(&bytes).await?;
        Ok(())
    }

    /// Receive the next session-secured frame, failing after the reply
    /// timeout.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut buf = vec![0u8; 1024];
        let len = tokio::time::timeout(REPLY_TIMEOUT, self.socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout)??;

        let frame = decode_frame(&buf[..len])?;
        if frame.variant() != ProtocolVariant::SessionSecured {
            return Err(Error::MalformedFrame("expected session-secured reply"));
        }
        Ok(frame)
    }

    /// Build the open-session request payload.
    fn open_session_request(&self, privilege: PrivilegeLevel) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8);
        payload.push(0x00); // message tag
        payload.push(privilege.as_u8());
        payload.extend_from_slice(&[0x00, 0x00]); // reserved
        payload.extend_from_slice(&self.console_session_id.to_le_bytes());
        payload
    }

    /// Attempt RMCP+ session establishment.
    ///
    /// Sends the open-session request and reads the reply, then fails with
    /// [`Error::Unsupported`]: the follow-on RAKP message exchange is not
    /// implemented.
    pub async fn establish(&mut self, privilege: PrivilegeLevel) -> Result<()> {
        let request = self.open_session_request(privilege);
        self.send_frame(payload_type::SESSION_CONTROL, request).await?;

        let reply = self.recv_frame().await?;
        tracing::debug!(
            console_session_id = self.console_session_id,
            reply_len = reply.payload.len(),
            "open-session reply received"
        );

        Err(Error::Unsupported(
            "RAKP session establishment is not implemented",
        ))
    }

    /// Arm per-frame authentication with `secret` for subsequent sends.
    pub fn set_secret(&mut self, secret: SecretBytes) {
        self.secret = Some(secret);
    }

    /// Close the session. Idempotent: closing an unestablished client is a
    /// no-op.
    pub async fn close(&mut self) -> Result<()> {
        if !self.established {
            return Ok(());
        }
        self.established = false;
        self.bmc_session_id = 0;
        Ok(())
    }
}
