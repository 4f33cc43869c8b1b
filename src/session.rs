use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::RngCore;

use crate::crypto::SecretBytes;
use crate::dispatch::{CommandHandler, CommandReply, RequestContext};
use crate::error::{Error, Result};
use crate::protocol::{CompletionCode, IpmiRequest, auth_type};

/// Username of the bootstrap administrator account.
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
/// Default secret of the bootstrap administrator account.
pub const DEFAULT_ADMIN_PASSWORD: &str = "password";

/// The privilege level owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrivilegeLevel {
    /// Callback privilege.
    Callback = 0x01,
    /// User privilege.
    User = 0x02,
    /// Operator privilege.
    Operator = 0x03,
    /// Administrator privilege.
    Administrator = 0x04,
    /// OEM-defined privilege.
    Oem = 0x05,
}

impl PrivilegeLevel {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Direction of a recorded session sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceDirection {
    /// Client to BMC.
    Inbound,
    /// BMC to client.
    Outbound,
}

/// Lifecycle state of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A challenge was issued but the session is not activated yet.
    ChallengeIssued,
    /// The session is active.
    Activated,
}

#[derive(Debug)]
struct Session {
    username: String,
    privilege: PrivilegeLevel,
    auth_type: u8,
    authenticated: bool,
    state: SessionState,
    inbound_seq: u32,
    outbound_seq: u32,
}

impl Session {
    /// Fresh pre-activation session bound to the bootstrap administrator.
    fn pending() -> Self {
        Self {
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            privilege: PrivilegeLevel::Administrator,
            auth_type: auth_type::NONE,
            authenticated: false,
            state: SessionState::ChallengeIssued,
            inbound_seq: 0,
            outbound_seq: 0,
        }
    }
}

/// Snapshot of a session's authentication context.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Whether per-message auth codes apply to this session.
    pub authenticated: bool,
    /// Session auth type byte.
    pub auth_type: u8,
    /// Secret of the session's user.
    pub secret: SecretBytes,
}

#[derive(Default)]
struct DirectoryInner {
    users: HashMap<String, SecretBytes>,
    sessions: HashMap<u32, Session>,
}

/// Per-instance session and user directory.
///
/// One read/write lock scoped to the owning instance; different instances
/// activate and close sessions without contention.
pub struct SessionDirectory {
    inner: RwLock<DirectoryInner>,
    strict_sequence: bool,
}

impl SessionDirectory {
    /// Create a directory seeded with the bootstrap administrator.
    pub fn new(strict_sequence: bool) -> Self {
        let mut inner = DirectoryInner::default();
        inner.users.insert(
            DEFAULT_ADMIN_USERNAME.to_string(),
            SecretBytes::new(DEFAULT_ADMIN_PASSWORD.as_bytes().to_vec()),
        );
        Self {
            inner: RwLock::new(inner),
            strict_sequence,
        }
    }

    /// Register an additional user.
    pub fn add_user(&self, username: impl Into<String>, secret: SecretBytes) -> Result<()> {
        let username = username.into();
        let mut inner = self.inner.write();
        if inner.users.contains_key(&username) {
            return Err(Error::InvalidArgument("user already exists"));
        }
        inner.users.insert(username, secret);
        Ok(())
    }

    /// Look up a user's secret.
    pub fn user_secret(&self, username: &str) -> Option<SecretBytes> {
        self.inner.read().users.get(username).cloned()
    }

    fn random_unused_id(inner: &DirectoryInner) -> u32 {
        let mut rng = rand::rng();
        loop {
            let id = rng.next_u32();
            if id != 0 && !inner.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Issue a session challenge: a fresh temporary session id plus a random
    /// 16-byte challenge string. Accepted unconditionally in server role.
    pub fn issue_challenge(&self) -> (u32, [u8; 16]) {
        let mut challenge = [0u8; 16];
        rand::rng().fill_bytes(&mut challenge);

        let mut inner = self.inner.write();
        let id = Self::random_unused_id(&inner);
        inner.sessions.insert(id, Session::pending());
        (id, challenge)
    }

    /// Activate a session, binding it to the default administrator at
    /// Administrator privilege.
    ///
    /// When `requested` names a pending challenge, that session is promoted;
    /// otherwise a fresh session is created (the reference behavior accepts
    /// activation without a matching challenge).
    pub fn activate(&self, requested: Option<u32>, session_auth_type: u8) -> u32 {
        let mut inner = self.inner.write();

        let id = match requested {
            Some(id)
                if inner
                    .sessions
                    .get(&id)
                    .is_some_and(|s| s.state == SessionState::ChallengeIssued) =>
            {
                id
            }
            _ => Self::random_unused_id(&inner),
        };

        let session = inner.sessions.entry(id).or_insert_with(Session::pending);
        session.state = SessionState::Activated;
        session.auth_type = session_auth_type;
        session.authenticated = session_auth_type != auth_type::NONE;
        id
    }

    /// Close a session. Idempotent: unknown or already-closed ids succeed
    /// with no side effect.
    pub fn close(&self, id: u32) {
        self.inner.write().sessions.remove(&id);
    }

    /// State of a session, if tracked.
    pub fn state(&self, id: u32) -> Option<SessionState> {
        self.inner.read().sessions.get(&id).map(|s| s.state)
    }

    /// Privilege level of a session, if tracked.
    pub fn privilege(&self, id: u32) -> Option<PrivilegeLevel> {
        self.inner.read().sessions.get(&id).map(|s| s.privilege)
    }

    /// Authentication context of an activated session.
    pub fn auth_context(&self, id: u32) -> Option<AuthContext> {
        let inner = self.inner.read();
        let session = inner.sessions.get(&id)?;
        if session.state != SessionState::Activated {
            return None;
        }
        let secret = inner.users.get(&session.username)?.clone();
        Some(AuthContext {
            authenticated: session.authenticated,
            auth_type: session.auth_type,
            secret,
        })
    }

    /// Record a per-direction sequence number under the directory lock.
    ///
    /// The reference behavior only records the highest number seen; strict
    /// rejection of non-increasing numbers is opt-in via configuration.
    pub fn record_sequence(&self, id: u32, direction: SequenceDirection, seq: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.get_mut(&id) else {
            return Ok(());
        };

        let slot = match direction {
            SequenceDirection::Inbound => &mut session.inbound_seq,
            SequenceDirection::Outbound => &mut session.outbound_seq,
        };

        if self.strict_sequence && seq <= *slot && seq != 0 {
            return Err(Error::AuthenticationFailed(
                "non-increasing session sequence number",
            ));
        }
        if seq > *slot {
            *slot = seq;
        }
        Ok(())
    }

    /// Allocate the next outbound sequence number for a session.
    pub fn next_outbound_seq(&self, id: u32) -> u32 {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(&id) {
            Some(session) => {
                session.outbound_seq = session.outbound_seq.wrapping_add(1);
                session.outbound_seq
            }
            None => 0,
        }
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Whether no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_u32_le(data: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(..4)?.try_into().ok()?))
}

/// `Get Channel Authentication Capabilities` (App, 0x38).
pub(crate) struct GetAuthCapabilitiesHandler;

#[async_trait]
impl CommandHandler for GetAuthCapabilitiesHandler {
    async fn handle(&self, _ctx: &RequestContext, request: &IpmiRequest) -> CommandReply {
        tracing::debug!(netfn = request.netfn, cmd = request.cmd, "get auth capabilities");

        let channel = request.data.first().map_or(0x01, |b| b & 0x0F);
        // Supported v1.5 auth types: none and straight password.
        let auth_support = 0x01 | 0x10;
        CommandReply::ok(vec![
            channel,
            auth_support,
            0x00, // per-message and user-level auth enabled
            0x00, // no v2.0 extended data
            0x00,
            0x00,
            0x00,
            0x00,
        ])
    }
}

/// `Get Session Challenge` (App, 0x39). Accepted unconditionally.
pub(crate) struct GetSessionChallengeHandler {
    pub(crate) sessions: Arc<SessionDirectory>,
}

#[async_trait]
impl CommandHandler for GetSessionChallengeHandler {
    async fn handle(&self, _ctx: &RequestContext, _request: &IpmiRequest) -> CommandReply {
        let (session_id, challenge) = self.sessions.issue_challenge();
        tracing::debug!(session_id, "issued session challenge");

        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&session_id.to_le_bytes());
        data.extend_from_slice(&challenge);
        CommandReply::ok(data)
    }
}

/// `Activate Session` (App, 0x3A). Binds the default administrator at
/// Administrator privilege.
pub(crate) struct ActivateSessionHandler {
    pub(crate) sessions: Arc<SessionDirectory>,
}

#[async_trait]
impl CommandHandler for ActivateSessionHandler {
    async fn handle(&self, ctx: &RequestContext, request: &IpmiRequest) -> CommandReply {
        let requested_auth = request.data.first().map_or(auth_type::NONE, |b| b & 0x0F);
        // The temporary id from Get Session Challenge arrives in the frame's
        // session header; activation without it still succeeds (reference
        // behavior).
        let requested_id = (ctx.session_id != 0).then_some(ctx.session_id);

        let session_id = self.sessions.activate(requested_id, requested_auth);
        tracing::debug!(session_id, auth_type = requested_auth, "activated session");

        let mut data = Vec::with_capacity(10);
        data.push(requested_auth);
        data.extend_from_slice(&session_id.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes()); // initial inbound sequence
        data.push(PrivilegeLevel::Administrator.as_u8());
        CommandReply::ok(data)
    }
}

/// `Close Session` (App, 0x3C). Idempotent.
pub(crate) struct CloseSessionHandler {
    pub(crate) sessions: Arc<SessionDirectory>,
}

#[async_trait]
impl CommandHandler for CloseSessionHandler {
    async fn handle(&self, ctx: &RequestContext, request: &IpmiRequest) -> CommandReply {
        // The id to close arrives in the request data; fall back to the
        // frame's own session id when the field is absent.
        let id = read_u32_le(&request.data).unwrap_or(ctx.session_id);
        self.sessions.close(id);
        tracing::debug!(session_id = id, "closed session");
        CommandReply::code(CompletionCode::Completed)
    }
}
