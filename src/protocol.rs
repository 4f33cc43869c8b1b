use crate::crypto::{SecretBytes, ct_eq, frame_auth_code};
use crate::error::{Error, Result};

/// RMCP header values.
const RMCP_VERSION: u8 = 0x06;
const RMCP_RESERVED: u8 = 0x00;
pub(crate) const RMCP_SEQ_NO_ACK: u8 = 0xFF;
const RMCP_CLASS_IPMI: u8 = 0x07;

/// Session authentication types (IPMI v1.5 session header byte).
///
/// `RMCP_PLUS` (0x06) doubles as the format discriminator: a frame whose
/// auth-type byte carries it uses the session-secured layout.
pub mod auth_type {
    /// No per-message authentication.
    pub const NONE: u8 = 0x00;
    /// MD2 authentication (not implemented here, recognized on the wire).
    pub const MD2: u8 = 0x01;
    /// MD5 authentication (not implemented here, recognized on the wire).
    pub const MD5: u8 = 0x02;
    /// Straight password authentication.
    pub const PASSWORD: u8 = 0x04;
    /// Marks the session-secured (RMCP+) frame format.
    pub const RMCP_PLUS: u8 = 0x06;
}

/// Payload type numbers carried by the session-secured variant.
pub mod payload_type {
    /// Standard IPMI payload.
    pub const IPMI: u8 = 0x00;
    /// Serial-over-LAN payload.
    pub const SOL: u8 = 0x01;
    /// OEM payload.
    pub const OEM: u8 = 0x02;
    /// Session setup/control payload.
    pub const SESSION_CONTROL: u8 = 0x03;
}

/// Network function numbers served by a virtual BMC.
pub mod netfn {
    /// Chassis requests.
    pub const CHASSIS: u8 = 0x00;
    /// Application (session management) requests.
    pub const APP: u8 = 0x06;
}

/// Command numbers served by a virtual BMC.
pub mod command {
    /// Get Chassis Status.
    pub const CHASSIS_STATUS: u8 = 0x01;
    /// Chassis Control.
    pub const CHASSIS_CONTROL: u8 = 0x02;
    /// Set System Boot Options.
    pub const SET_SYSTEM_BOOT_OPTIONS: u8 = 0x08;
    /// Get Channel Authentication Capabilities.
    pub const GET_AUTH_CAPABILITIES: u8 = 0x38;
    /// Get Session Challenge.
    pub const GET_SESSION_CHALLENGE: u8 = 0x39;
    /// Activate Session.
    pub const ACTIVATE_SESSION: u8 = 0x3A;
    /// Close Session.
    pub const CLOSE_SESSION: u8 = 0x3C;
}

/// IPMI completion codes (standard table subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    /// Command completed normally.
    Completed = 0x00,
    /// Node busy.
    NodeBusy = 0xC0,
    /// Invalid or unsupported command.
    InvalidCommand = 0xC1,
    /// Command invalid for the given object/LUN.
    InvalidObjCommand = 0xC2,
    /// Invalid data field in request.
    InvalidDataField = 0xCC,
    /// Unspecified error.
    Unspecified = 0xFF,
}

impl CompletionCode {
    /// Raw wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol variant a frame was encoded with.
///
/// The two variants disagree on the byte order of session ids and sequence
/// numbers, so the order is keyed off the variant explicitly instead of
/// being inferred from field position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// IPMI v1.5-era session framing. Session ids are big-endian.
    Legacy,
    /// RMCP+ session framing. Ids and sequence numbers are little-endian.
    SessionSecured,
}

impl ProtocolVariant {
    pub(crate) fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Legacy => u32::from_be_bytes(bytes),
            Self::SessionSecured => u32::from_le_bytes(bytes),
        }
    }

    pub(crate) fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::Legacy => value.to_be_bytes(),
            Self::SessionSecured => value.to_le_bytes(),
        }
    }
}

/// Session header portion of a frame, one layout per variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHeader {
    /// Legacy layout: auth type, five reserved bytes, big-endian session id.
    Legacy {
        /// Session authentication type byte.
        auth_type: u8,
        /// Session id, zero outside a session.
        session_id: u32,
    },
    /// Session-secured layout: payload type, little-endian id and sequence.
    Secured {
        /// Payload type number (see [`payload_type`]).
        payload_type: u8,
        /// Session id, zero during session setup.
        session_id: u32,
        /// Per-direction session sequence number.
        session_seq: u32,
    },
}

impl SessionHeader {
    /// Variant this header belongs to.
    pub fn variant(&self) -> ProtocolVariant {
        match self {
            Self::Legacy { .. } => ProtocolVariant::Legacy,
            Self::Secured { .. } => ProtocolVariant::SessionSecured,
        }
    }

    /// Session id carried by the header.
    pub fn session_id(&self) -> u32 {
        match *self {
            Self::Legacy { session_id, .. } | Self::Secured { session_id, .. } => session_id,
        }
    }
}

/// A decoded RMCP/RMCP+ frame.
///
/// `payload` carries the IPMI LAN message (or, for the session-secured
/// variant, whatever the payload type says it carries). The optional
/// trailing authentication code is kept verbatim so verification can be
/// performed against the raw datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// RMCP sequence byte (0xFF means "no RMCP ACK requested").
    pub rmcp_seq: u8,
    /// Variant-specific session header.
    pub header: SessionHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Trailing 20-byte authentication code, when present.
    pub auth_code: Option<[u8; 20]>,
}

impl Frame {
    /// Build an unauthenticated legacy frame.
    pub fn legacy(auth_type: u8, session_id: u32, payload: Vec<u8>) -> Self {
        Self {
            rmcp_seq: RMCP_SEQ_NO_ACK,
            header: SessionHeader::Legacy {
                auth_type,
                session_id,
            },
            payload,
            auth_code: None,
        }
    }

    /// Build an unauthenticated session-secured frame.
    pub fn secured(payload_type: u8, session_id: u32, session_seq: u32, payload: Vec<u8>) -> Self {
        Self {
            rmcp_seq: RMCP_SEQ_NO_ACK,
            header: SessionHeader::Secured {
                payload_type,
                session_id,
                session_seq,
            },
            payload,
            auth_code: None,
        }
    }

    /// Variant this frame was (or will be) encoded with.
    pub fn variant(&self) -> ProtocolVariant {
        self.header.variant()
    }
}

/// Minimum size of a legacy frame: RMCP header, session header, one command byte.
const LEGACY_MIN_LEN: usize = 15;
/// Size of the session-secured header including the RMCP header.
const SECURED_HEADER_LEN: usize = 16;
/// Length of a trailing frame authentication code (untruncated HMAC-SHA1).
pub(crate) const AUTH_CODE_LEN: usize = 20;

/// Encode a frame into wire bytes.
///
/// Field order is fixed: RMCP header, session header, payload, optional
/// trailing authentication code.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(SECURED_HEADER_LEN + frame.payload.len() + AUTH_CODE_LEN);

    out.push(RMCP_VERSION);
    out.push(RMCP_RESERVED);
    out.push(frame.rmcp_seq);
    out.push(RMCP_CLASS_IPMI);

    match frame.header {
        SessionHeader::Legacy {
            auth_type,
            session_id,
        } => {
            if frame.auth_code.is_some() {
                return Err(Error::Unsupported(
                    "legacy frames do not carry trailing auth codes",
                ));
            }
            out.push(auth_type);
            out.extend_from_slice(&[0u8; 5]);
            out.extend_from_slice(&ProtocolVariant::Legacy.write_u32(session_id));
            out.extend_from_slice(&frame.payload);
        }
        SessionHeader::Secured {
            payload_type,
            session_id,
            session_seq,
        } => {
            let payload_len: u16 = frame
                .payload
                .len()
                .try_into()
                .map_err(|_| Error::InvalidArgument("payload too large"))?;

            out.push(auth_type::RMCP_PLUS);
            out.push(payload_type);
            out.extend_from_slice(&ProtocolVariant::SessionSecured.write_u32(session_id));
            out.extend_from_slice(&ProtocolVariant::SessionSecured.write_u32(session_seq));
            out.extend_from_slice(&payload_len.to_le_bytes());
            out.extend_from_slice(&frame.payload);
            if let Some(code) = &frame.auth_code {
                out.extend_from_slice(code);
            }
        }
    }

    Ok(out)
}

/// Encode a session-secured frame and append the authentication code computed
/// over everything preceding it.
pub fn encode_frame_authenticated(frame: &Frame, secret: &SecretBytes) -> Result<Vec<u8>> {
    if frame.variant() != ProtocolVariant::SessionSecured {
        return Err(Error::Unsupported(
            "legacy frames do not carry trailing auth codes",
        ));
    }
    let mut unauthenticated = frame.clone();
    unauthenticated.auth_code = None;

    let mut out = encode_frame(&unauthenticated)?;
    let code = frame_auth_code(secret, &out)?;
    out.extend_from_slice(&code);
    Ok(out)
}

/// Decode wire bytes into a frame.
///
/// The variant is selected by the auth-type byte; all declared lengths are
/// validated against the buffer before any field is read past.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < 4 + 1 {
        return Err(Error::MalformedFrame("frame shorter than RMCP header"));
    }
    if bytes[0] != RMCP_VERSION {
        return Err(Error::MalformedFrame("unsupported RMCP version"));
    }
    if bytes[3] != RMCP_CLASS_IPMI {
        return Err(Error::MalformedFrame("unsupported RMCP class"));
    }

    if bytes[4] == auth_type::RMCP_PLUS {
        decode_secured(bytes)
    } else {
        decode_legacy(bytes)
    }
}

fn decode_legacy(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < LEGACY_MIN_LEN {
        return Err(Error::MalformedFrame("legacy frame too short"));
    }

    let session_id = ProtocolVariant::Legacy.read_u32(
        bytes[10..14]
            .try_into()
            .map_err(|_| Error::MalformedFrame("invalid session id"))?,
    );

    Ok(Frame {
        rmcp_seq: bytes[2],
        header: SessionHeader::Legacy {
            auth_type: bytes[4],
            session_id,
        },
        payload: bytes[14..].to_vec(),
        auth_code: None,
    })
}

fn decode_secured(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < SECURED_HEADER_LEN {
        return Err(Error::MalformedFrame("session-secured frame too short"));
    }

    let variant = ProtocolVariant::SessionSecured;
    let session_id = variant.read_u32(
        bytes[6..10]
            .try_into()
            .map_err(|_| Error::MalformedFrame("invalid session id"))?,
    );
    let session_seq = variant.read_u32(
        bytes[10..14]
            .try_into()
            .map_err(|_| Error::MalformedFrame("invalid session sequence"))?,
    );
    let payload_len = u16::from_le_bytes(
        bytes[14..16]
            .try_into()
            .map_err(|_| Error::MalformedFrame("invalid payload length"))?,
    ) as usize;

    let payload_end = SECURED_HEADER_LEN + payload_len;
    if bytes.len() < payload_end {
        return Err(Error::MalformedFrame(
            "declared payload length exceeds buffer",
        ));
    }

    let auth_code = match bytes.len() - payload_end {
        0 => None,
        AUTH_CODE_LEN => {
            let code: [u8; AUTH_CODE_LEN] = bytes[payload_end..]
                .try_into()
                .map_err(|_| Error::MalformedFrame("invalid auth code"))?;
            Some(code)
        }
        _ => return Err(Error::MalformedFrame("unexpected trailing bytes")),
    };

    Ok(Frame {
        rmcp_seq: bytes[2],
        header: SessionHeader::Secured {
            payload_type: bytes[5],
            session_id,
            session_seq,
        },
        payload: bytes[SECURED_HEADER_LEN..payload_end].to_vec(),
        auth_code,
    })
}

/// Verify the trailing authentication code of a raw session-secured datagram.
///
/// The authenticated range is everything before the code. A mismatch fails
/// with [`Error::AuthenticationFailed`]; callers drop the frame before any
/// handler runs.
pub fn verify_auth_code(raw: &[u8], secret: &SecretBytes) -> Result<()> {
    if raw.len() < SECURED_HEADER_LEN + AUTH_CODE_LEN {
        return Err(Error::MalformedFrame("frame too short for auth code"));
    }

    let split = raw.len() - AUTH_CODE_LEN;
    let expected = frame_auth_code(secret, &raw[..split])?;
    if !ct_eq(&raw[split..], &expected) {
        return Err(Error::AuthenticationFailed("invalid frame auth code"));
    }
    Ok(())
}

/// Compute the standard 2's complement checksum used by IPMI LAN messages.
fn ipmi_checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// A decoded IPMI LAN request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmiRequest {
    /// Responder (BMC) slave address.
    pub rs_addr: u8,
    /// Requester (remote console) slave address.
    pub rq_addr: u8,
    /// Network function.
    pub netfn: u8,
    /// Logical unit number (low two bits of the netfn byte).
    pub lun: u8,
    /// Requester sequence number (6-bit).
    pub rq_seq: u8,
    /// Command number.
    pub cmd: u8,
    /// Request data bytes.
    pub data: Vec<u8>,
}

/// Decode and validate an IPMI LAN request message.
///
/// Layout: `[rs_addr][netfn/lun][csum1][rq_addr][rq_seq/lun][cmd][data..][csum2]`.
pub fn decode_ipmi_lan_request(msg: &[u8]) -> Result<IpmiRequest> {
    if msg.len() < 7 {
        return Err(Error::MalformedFrame("IPMI message too short"));
    }

    let rs_addr = msg[0];
    let netfn_lun = msg[1];
    let csum1 = msg[2];

    // Checksum over a range plus its checksum byte must sum to zero.
    if rs_addr.wrapping_add(netfn_lun).wrapping_add(csum1) != 0 {
        return Err(Error::MalformedFrame("invalid IPMI checksum1"));
    }

    let provided_csum2 = *msg.last().ok_or(Error::MalformedFrame("missing checksum2"))?;
    let sum2 = msg[3..msg.len() - 1]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_add(provided_csum2);
    if sum2 != 0 {
        return Err(Error::MalformedFrame("invalid IPMI checksum2"));
    }

    let data = if msg.len() > 7 {
        msg[6..msg.len() - 1].to_vec()
    } else {
        Vec::new()
    };

    Ok(IpmiRequest {
        rs_addr,
        rq_addr: msg[3],
        netfn: netfn_lun >> 2,
        lun: netfn_lun & 0x03,
        rq_seq: msg[4] >> 2,
        cmd: msg[5],
        data,
    })
}

/// Encode an IPMI LAN request message.
pub fn encode_ipmi_lan_request(netfn: u8, cmd: u8, rq_seq: u8, data: &[u8]) -> Result<Vec<u8>> {
    if rq_seq > 0x3F {
        return Err(Error::InvalidArgument("rq_seq must be 6-bit"));
    }

    // Constants per LAN interface.
    let responder_addr: u8 = 0x20;
    let requester_addr: u8 = 0x81;
    let lun: u8 = 0;

    let netfn_lun = (netfn << 2) | (lun & 0x03);
    let csum1 = ipmi_checksum(&[responder_addr, netfn_lun]);

    let rq_seq_lun = (rq_seq << 2) | (lun & 0x03);

    let mut msg = Vec::with_capacity(7 + data.len() + 1);
    msg.push(responder_addr);
    msg.push(netfn_lun);
    msg.push(csum1);

    msg.push(requester_addr);
    msg.push(rq_seq_lun);
    msg.push(cmd);
    msg.extend_from_slice(data);

    let csum2 = ipmi_checksum(&msg[3..]);
    msg.push(csum2);

    Ok(msg)
}

/// Encode the IPMI LAN response to a request.
///
/// Addresses swap direction, the network function gains the response bit,
/// and the completion code precedes the response data.
pub fn encode_ipmi_lan_response(
    request: &IpmiRequest,
    completion_code: CompletionCode,
    data: &[u8],
) -> Vec<u8> {
    let netfn_lun = ((request.netfn | 0x01) << 2) | (request.lun & 0x03);
    let csum1 = ipmi_checksum(&[request.rq_addr, netfn_lun]);
    let rq_seq_lun = (request.rq_seq << 2) | (request.lun & 0x03);

    let mut msg = Vec::with_capacity(8 + data.len());
    msg.push(request.rq_addr);
    msg.push(netfn_lun);
    msg.push(csum1);

    msg.push(request.rs_addr);
    msg.push(rq_seq_lun);
    msg.push(request.cmd);
    msg.push(completion_code.as_u8());
    msg.extend_from_slice(data);

    let csum2 = ipmi_checksum(&msg[3..]);
    msg.push(csum2);

    msg
}
