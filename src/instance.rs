use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::addr::AddressManager;
use crate::chassis::{ChassisControlHandler, ChassisStatusHandler, SetBootOptionsHandler};
use crate::dispatch::{CommandTable, RequestContext};
use crate::error::{Error, Result};
use crate::hypervisor::{HypervisorControl, VmId};
use crate::protocol::{
    self, Frame, SessionHeader, decode_frame, decode_ipmi_lan_request, encode_frame,
    encode_frame_authenticated, encode_ipmi_lan_response, payload_type, verify_auth_code,
};
use crate::session::{
    ActivateSessionHandler, CloseSessionHandler, GetAuthCapabilitiesHandler,
    GetSessionChallengeHandler, SequenceDirection, SessionDirectory,
};

/// Largest datagram a BMC endpoint accepts.
const MAX_DATAGRAM: usize = 1024;

/// Static parameters of one BMC endpoint.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// VM this endpoint fronts.
    pub vm: VmId,
    /// Address the endpoint listens on.
    pub addr: Ipv4Addr,
    /// UDP port (0 picks an ephemeral port, useful under test).
    pub port: u16,
    /// Reject non-increasing session sequence numbers.
    pub strict_sequence: bool,
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Constructed, not serving.
    Created,
    /// Endpoint address ensured on the interface.
    IpConfigured,
    /// Receive loop running.
    Listening,
    /// Stopped; the endpoint address has been released if this instance
    /// added it.
    Stopped,
}

/// Frame-to-reply pipeline shared by the receive loop's worker tasks.
struct Engine {
    vm: VmId,
    sessions: Arc<SessionDirectory>,
    table: CommandTable,
}

impl Engine {
    fn new(
        vm: VmId,
        hypervisor: Arc<dyn HypervisorControl>,
        strict_sequence: bool,
    ) -> Self {
        let sessions = Arc::new(SessionDirectory::new(strict_sequence));

        let mut table = CommandTable::new();
        table.register(
            protocol::netfn::CHASSIS,
            protocol::command::CHASSIS_STATUS,
            Arc::new(ChassisStatusHandler::new(vm.clone(), hypervisor.clone())),
        );
        table.register(
            protocol::netfn::CHASSIS,
            protocol::command::CHASSIS_CONTROL,
            Arc::new(ChassisControlHandler::new(vm.clone(), hypervisor.clone())),
        );
        table.register(
            protocol::netfn::CHASSIS,
            protocol::command::SET_SYSTEM_BOOT_OPTIONS,
            Arc::new(SetBootOptionsHandler::new(vm.clone(), hypervisor)),
        );
        table.register(
            protocol::netfn::APP,
            protocol::command::GET_AUTH_CAPABILITIES,
            Arc::new(GetAuthCapabilitiesHandler),
        );
        table.register(
            protocol::netfn::APP,
            protocol::command::GET_SESSION_CHALLENGE,
            Arc::new(GetSessionChallengeHandler {
                sessions: sessions.clone(),
            }),
        );
        table.register(
            protocol::netfn::APP,
            protocol::command::ACTIVATE_SESSION,
            Arc::new(ActivateSessionHandler {
                sessions: sessions.clone(),
            }),
        );
        table.register(
            protocol::netfn::APP,
            protocol::command::CLOSE_SESSION,
            Arc::new(CloseSessionHandler {
                sessions: sessions.clone(),
            }),
        );

        Self { vm, sessions, table }
    }

    /// Decode, authenticate, dispatch, and encode the reply for one datagram.
    async fn process(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let frame = decode_frame(raw)?;
        let session_id = frame.header.session_id();
        let auth = self.sessions.auth_context(session_id);

        // Integrity check comes before anything else touches the payload.
        // Only session-secured frames carry trailing auth codes.
        if let SessionHeader::Secured {
            payload_type: pt,
            session_seq,
            ..
        } = &frame.header
        {
            if *pt != payload_type::IPMI {
                return Err(Error::Unsupported("non-IPMI payload type"));
            }
            if let Some(ctx) = &auth {
                if ctx.authenticated {
                    verify_auth_code(raw, &ctx.secret)?;
                }
            }
            self.sessions
                .record_sequence(session_id, SequenceDirection::Inbound, *session_seq)?;
        }

        let request = decode_ipmi_lan_request(&frame.payload)?;
        let ctx = RequestContext { session_id };
        let reply = self.table.dispatch(&ctx, &request).await;
        let payload = encode_ipmi_lan_response(&request, reply.code, &reply.data);

        // The reply mirrors the request's variant and session id.
        match frame.header {
            SessionHeader::Legacy { auth_type, .. } => {
                encode_frame(&Frame::legacy(auth_type, session_id, payload))
            }
            SessionHeader::Secured { payload_type, .. } => {
                let seq = self.sessions.next_outbound_seq(session_id);
                let reply_frame = Frame::secured(payload_type, session_id, seq, payload);
                match auth {
                    Some(ctx) if ctx.authenticated => {
                        encode_frame_authenticated(&reply_frame, &ctx.secret)
                    }
                    _ => encode_frame(&reply_frame),
                }
            }
        }
    }

    /// Handle one datagram end to end, sending the reply to `peer`.
    ///
    /// Undecodable or unauthenticated datagrams are dropped without a reply.
    async fn respond(&self, socket: &UdpSocket, peer: SocketAddr, raw: &[u8]) {
        let vm = &self.vm;
        crate::debug::trace_frame("recv", peer, raw);
        match self.process(raw).await {
            Ok(reply) => {
                crate::debug::trace_frame("send", peer, &reply);
                if let Err(err) = socket.send_to(&reply, peer).await {
                    tracing::warn!(%vm, %peer, error = %err, "failed to send reply");
                }
            }
            Err(Error::MalformedFrame(reason)) => {
                tracing::debug!(%vm, %peer, reason, "dropping malformed datagram");
            }
            Err(Error::AuthenticationFailed(reason)) => {
                tracing::warn!(%vm, %peer, reason, "dropping unauthenticated datagram");
            }
            Err(err) => {
                tracing::warn!(%vm, %peer, error = %err, "dropping datagram");
            }
        }
    }
}

/// One virtual BMC: a UDP endpoint serving the IPMI command surface for a
/// single VM.
///
/// Instances are independent; each owns its socket, session directory, and
/// dispatch table, and is supervised through `start`/`stop`.
pub struct VirtualBmcInstance {
    spec: InstanceSpec,
    hypervisor: Arc<dyn HypervisorControl>,
    addresses: Arc<dyn AddressManager>,
    state: InstanceState,
    ip_added: bool,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    recv_task: Option<JoinHandle<()>>,
}

impl VirtualBmcInstance {
    /// Build a stopped instance.
    pub fn new(
        spec: InstanceSpec,
        hypervisor: Arc<dyn HypervisorControl>,
        addresses: Arc<dyn AddressManager>,
    ) -> Self {
        Self {
            spec,
            hypervisor,
            addresses,
            state: InstanceState::Created,
            ip_added: false,
            local_addr: None,
            shutdown: None,
            recv_task: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// VM this instance fronts.
    pub fn vm(&self) -> &VmId {
        &self.spec.vm
    }

    /// Bound socket address once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Ensure the endpoint address, bind the socket, and start serving.
    ///
    /// A failure after the address was added releases it again before the
    /// error is returned; a failed start leaves nothing configured.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            InstanceState::Created | InstanceState::Stopped => {}
            _ => return Err(Error::InvalidArgument("instance already started")),
        }
        let vm = self.spec.vm.clone();

        // Only addresses this instance added are released afterwards; a
        // pre-existing address stays configured.
        if self.addresses.is_present(self.spec.addr).await? {
            tracing::debug!(%vm, addr = %self.spec.addr, "endpoint address already configured");
        } else {
            self.addresses.add(self.spec.addr).await?;
            self.ip_added = true;
        }
        self.state = InstanceState::IpConfigured;

        match self.serve().await {
            Ok(local_addr) => {
                self.state = InstanceState::Listening;
                tracing::info!(%vm, %local_addr, "virtual BMC listening");
                Ok(())
            }
            Err(err) => {
                self.release_address().await;
                self.state = InstanceState::Stopped;
                Err(err)
            }
        }
    }

    /// Bind the socket and spawn the receive loop.
    async fn serve(&mut self) -> Result<SocketAddr> {
        let engine = Arc::new(Engine::new(
            self.spec.vm.clone(),
            self.hypervisor.clone(),
            self.spec.strict_sequence,
        ));

        let socket = Arc::new(UdpSocket::bind((self.spec.addr, self.spec.port)).await?);
        let local_addr = socket.local_addr()?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.recv_task = Some(tokio::spawn(recv_loop(
            self.spec.vm.clone(),
            socket,
            engine,
            shutdown_rx,
        )));
        Ok(local_addr)
    }

    /// Release the endpoint address if this instance added it. Failures are
    /// logged and do not propagate.
    async fn release_address(&mut self) {
        if !self.ip_added {
            return;
        }
        if let Err(err) = self.addresses.remove(self.spec.addr).await {
            tracing::warn!(vm = %self.spec.vm, addr = %self.spec.addr, error = %err,
                "failed to release endpoint address");
        }
        self.ip_added = false;
    }

    /// Stop serving and release the endpoint address if this instance added
    /// it. Runs the address release regardless of how far a start got.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == InstanceState::Listening {
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(true);
            }
            if let Some(task) = self.recv_task.take() {
                let _ = task.await;
            }
            self.local_addr = None;
        }

        self.release_address().await;
        self.state = InstanceState::Stopped;
        tracing::info!(vm = %self.spec.vm, "virtual BMC stopped");
        Ok(())
    }
}

/// Receive loop: one task per instance reads datagrams and spawns a worker
/// per datagram. Both the loop and its workers race the shutdown signal.
async fn recv_loop(
    vm: VmId,
    socket: Arc<UdpSocket>,
    engine: Arc<Engine>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!(%vm, "receive loop shutting down");
                return;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        let datagram = buf[..len].to_vec();
                        let engine = engine.clone();
                        let socket = socket.clone();
                        let mut worker_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = worker_shutdown.changed() => {}
                                () = engine.respond(&socket, peer, &datagram) => {}
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%vm, error = %err, "recv_from failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::addr::NoopAddressManager;
    use crate::chassis::tests::FakeHypervisor;
    use crate::hypervisor::PowerState;
    use crate::protocol::{
        CompletionCode, auth_type, command, encode_ipmi_lan_request, netfn,
    };

    async fn start_instance(hv: Arc<FakeHypervisor>) -> VirtualBmcInstance {
        let spec = InstanceSpec {
            vm: VmId::new("vm-test"),
            addr: Ipv4Addr::LOCALHOST,
            port: 0,
            strict_sequence: false,
        };
        let mut instance =
            VirtualBmcInstance::new(spec, hv, Arc::new(NoopAddressManager));
        instance.start().await.expect("start");
        instance
    }

    async fn exchange(target: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
        client.send_to(datagram, target).await.expect("send");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    fn legacy_request(netfn: u8, cmd: u8, data: &[u8]) -> Vec<u8> {
        let msg = encode_ipmi_lan_request(netfn, cmd, 0, data).expect("encode");
        encode_frame(&Frame::legacy(auth_type::NONE, 0, msg)).expect("frame")
    }

    #[tokio::test]
    async fn power_up_over_the_wire_reaches_the_hypervisor_once() {
        let hv = Arc::new(FakeHypervisor::new(PowerState::Off));
        let mut instance = start_instance(hv.clone()).await;
        let target = instance.local_addr().expect("addr");

        let datagram = legacy_request(netfn::CHASSIS, command::CHASSIS_CONTROL, &[0x01]);
        let reply = exchange(target, &datagram).await.expect("reply");

        let frame = decode_frame(&reply).expect("decode");
        let response = frame.payload;
        assert_eq!(response[6], CompletionCode::Completed.as_u8());
        assert_eq!(hv.calls(), vec!["power_on:vm-test"]);

        instance.stop().await.expect("stop");
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn chassis_status_reflects_power_state() {
        let hv = Arc::new(FakeHypervisor::new(PowerState::On));
        let mut instance = start_instance(hv).await;
        let target = instance.local_addr().expect("addr");

        let datagram = legacy_request(netfn::CHASSIS, command::CHASSIS_STATUS, &[]);
        let reply = exchange(target, &datagram).await.expect("reply");

        let frame = decode_frame(&reply).expect("decode");
        assert_eq!(frame.payload[6], CompletionCode::Completed.as_u8());
        assert_eq!(frame.payload[7] & 0x01, 0x01);

        instance.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn unknown_command_gets_invalid_command() {
        let hv = Arc::new(FakeHypervisor::new(PowerState::Off));
        let mut instance = start_instance(hv.clone()).await;
        let target = instance.local_addr().expect("addr");

        let datagram = legacy_request(netfn::APP, 0x22, &[]);
        let reply = exchange(target, &datagram).await.expect("reply");

        let frame = decode_frame(&reply).expect("decode");
        assert_eq!(frame.payload[6], CompletionCode::InvalidCommand.as_u8());
        assert!(hv.calls().is_empty());

        instance.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped_without_reply() {
        let hv = Arc::new(FakeHypervisor::new(PowerState::Off));
        let mut instance = start_instance(hv).await;
        let target = instance.local_addr().expect("addr");

        assert!(exchange(target, &[0x01, 0x02, 0x03]).await.is_none());

        instance.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn two_instances_serve_independently() {
        let hv_a = Arc::new(FakeHypervisor::new(PowerState::Off));
        let hv_b = Arc::new(FakeHypervisor::new(PowerState::Off));
        let mut a = start_instance(hv_a.clone()).await;
        let mut b = start_instance(hv_b.clone()).await;

        let datagram = legacy_request(netfn::CHASSIS, command::CHASSIS_CONTROL, &[0x01]);
        exchange(a.local_addr().unwrap(), &datagram).await.expect("reply a");
        exchange(b.local_addr().unwrap(), &datagram).await.expect("reply b");

        assert_eq!(hv_a.calls(), vec!["power_on:vm-test"]);
        assert_eq!(hv_b.calls(), vec!["power_on:vm-test"]);

        a.stop().await.expect("stop a");
        b.stop().await.expect("stop b");
    }

    /// Address manager that records calls and reports every address absent.
    struct RecordingAddresses {
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingAddresses {
        fn new() -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl crate::addr::AddressManager for RecordingAddresses {
        async fn is_present(&self, _addr: Ipv4Addr) -> crate::error::Result<bool> {
            Ok(false)
        }

        async fn add(&self, addr: Ipv4Addr) -> crate::error::Result<()> {
            self.calls.lock().unwrap().push(format!("add:{addr}"));
            Ok(())
        }

        async fn remove(&self, addr: Ipv4Addr) -> crate::error::Result<()> {
            self.calls.lock().unwrap().push(format!("remove:{addr}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_bind_releases_the_added_address() {
        let hv = Arc::new(FakeHypervisor::new(PowerState::Off));
        let addresses = Arc::new(RecordingAddresses::new());
        // TEST-NET address: not configured on any interface, so the bind
        // fails after the address add succeeded.
        let spec = InstanceSpec {
            vm: VmId::new("vm-test"),
            addr: Ipv4Addr::new(192, 0, 2, 123),
            port: 0,
            strict_sequence: false,
        };
        let mut instance = VirtualBmcInstance::new(spec, hv, addresses.clone());

        instance.start().await.expect_err("bind must fail");
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert_eq!(
            addresses.calls(),
            vec!["add:192.0.2.123", "remove:192.0.2.123"]
        );

        // A follow-up stop does not release twice.
        instance.stop().await.expect("stop");
        assert_eq!(addresses.calls().len(), 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let hv = Arc::new(FakeHypervisor::new(PowerState::Off));
        let mut instance = start_instance(hv).await;

        instance.stop().await.expect("first stop");
        instance.stop().await.expect("second stop");
        assert_eq!(instance.state(), InstanceState::Stopped);
    }
}
