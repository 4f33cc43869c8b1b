//! End-to-end exercises of a virtual BMC endpoint over UDP.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use vbmc::protocol::{
    self, CompletionCode, Frame, auth_type, command, decode_frame, encode_frame,
    encode_ipmi_lan_request, netfn,
};
use vbmc::{
    BootDevice, Error, HypervisorControl, InstanceSpec, NoopAddressManager, PowerState, Result,
    VirtualBmcInstance, VmId,
};

struct RecordingHypervisor {
    calls: Mutex<Vec<String>>,
    power: Mutex<PowerState>,
}

impl RecordingHypervisor {
    fn new(initial: PowerState) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            power: Mutex::new(initial),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl HypervisorControl for RecordingHypervisor {
    async fn power_on(&self, vm: &VmId) -> Result<()> {
        self.record(format!("power_on:{vm}"));
        *self.power.lock().unwrap() = PowerState::On;
        Ok(())
    }

    async fn power_off(&self, vm: &VmId) -> Result<()> {
        self.record(format!("power_off:{vm}"));
        *self.power.lock().unwrap() = PowerState::Off;
        Ok(())
    }

    async fn reset(&self, vm: &VmId) -> Result<()> {
        self.record(format!("reset:{vm}"));
        if *self.power.lock().unwrap() == PowerState::Off {
            return Err(Error::InvalidArgument("cannot reset a powered-off VM"));
        }
        Ok(())
    }

    async fn power_state(&self, vm: &VmId) -> Result<PowerState> {
        self.record(format!("power_state:{vm}"));
        Ok(*self.power.lock().unwrap())
    }

    async fn set_next_boot(&self, vm: &VmId, device: BootDevice) -> Result<()> {
        self.record(format!("set_next_boot:{vm}:{device}"));
        Ok(())
    }
}

async fn start_bmc(
    name: &str,
    hypervisor: Arc<RecordingHypervisor>,
) -> (VirtualBmcInstance, SocketAddr) {
    let spec = InstanceSpec {
        vm: VmId::new(name),
        addr: Ipv4Addr::LOCALHOST,
        port: 0,
        strict_sequence: false,
    };
    let mut bmc = VirtualBmcInstance::new(spec, hypervisor, Arc::new(NoopAddressManager));
    bmc.start().await.expect("start");
    let addr = bmc.local_addr().expect("local addr");
    (bmc, addr)
}

struct Console {
    socket: UdpSocket,
    rq_seq: u8,
}

impl Console {
    async fn connect(target: SocketAddr) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
        socket.connect(target).await.expect("connect");
        Self { socket, rq_seq: 0 }
    }

    /// Send a legacy-framed request inside `session_id` and return the
    /// completion code and response data.
    async fn exchange(
        &mut self,
        session_id: u32,
        netfn: u8,
        cmd: u8,
        data: &[u8],
    ) -> (CompletionCode, Vec<u8>) {
        self.rq_seq = (self.rq_seq + 1) & 0x3F;
        let msg = encode_ipmi_lan_request(netfn, cmd, self.rq_seq, data).expect("encode request");
        let frame = encode_frame(&Frame::legacy(auth_type::NONE, session_id, msg))
            .expect("encode frame");
        self.socket.send(&frame).await.expect("send");

        let mut buf = vec![0u8; 1024];
        let len = tokio::time::timeout(Duration::from_secs(2), self.socket.recv(&mut buf))
            .await
            .expect("reply within timeout")
            .expect("recv");

        let reply = decode_frame(&buf[..len]).expect("decode frame");
        let payload = reply.payload;
        assert_eq!(payload[5], cmd, "reply echoes the command");

        let code = match payload[6] {
            0x00 => CompletionCode::Completed,
            0xC1 => CompletionCode::InvalidCommand,
            0xC2 => CompletionCode::InvalidObjCommand,
            0xCC => CompletionCode::InvalidDataField,
            0xFF => CompletionCode::Unspecified,
            other => panic!("unexpected completion code {other:#04x}"),
        };
        let data = payload[7..payload.len() - 1].to_vec();
        (code, data)
    }
}

#[tokio::test]
async fn session_lifecycle_and_power_control() {
    let hypervisor = Arc::new(RecordingHypervisor::new(PowerState::Off));
    let (mut bmc, addr) = start_bmc("guest-01", hypervisor.clone()).await;
    let mut console = Console::connect(addr).await;

    // Discover authentication capabilities outside a session.
    let (code, caps) = console
        .exchange(0, netfn::APP, command::GET_AUTH_CAPABILITIES, &[0x01, 0x04])
        .await;
    assert_eq!(code, CompletionCode::Completed);
    assert_ne!(caps[1] & 0x01, 0, "auth type none advertised");

    // Obtain a challenge and its temporary session id.
    let (code, challenge) = console
        .exchange(0, netfn::APP, command::GET_SESSION_CHALLENGE, &[])
        .await;
    assert_eq!(code, CompletionCode::Completed);
    let temp_id = u32::from_le_bytes(challenge[..4].try_into().unwrap());
    assert_ne!(temp_id, 0);

    // Activate inside the temporary session.
    let mut activate = vec![auth_type::NONE, 0x04];
    activate.extend_from_slice(&challenge[4..20]);
    activate.extend_from_slice(&1u32.to_le_bytes());
    let (code, activated) = console
        .exchange(temp_id, netfn::APP, command::ACTIVATE_SESSION, &activate)
        .await;
    assert_eq!(code, CompletionCode::Completed);
    let session_id = u32::from_le_bytes(activated[1..5].try_into().unwrap());
    assert_eq!(session_id, temp_id, "challenge session is promoted");

    // Power the VM on within the session.
    let (code, _) = console
        .exchange(session_id, netfn::CHASSIS, command::CHASSIS_CONTROL, &[0x01])
        .await;
    assert_eq!(code, CompletionCode::Completed);

    // Status now reports power on.
    let (code, status) = console
        .exchange(session_id, netfn::CHASSIS, command::CHASSIS_STATUS, &[])
        .await;
    assert_eq!(code, CompletionCode::Completed);
    assert_eq!(status[0] & 0x01, 0x01);

    // Close, twice: the second close is a harmless no-op.
    let close_data = session_id.to_le_bytes();
    let (code, _) = console
        .exchange(session_id, netfn::APP, command::CLOSE_SESSION, &close_data)
        .await;
    assert_eq!(code, CompletionCode::Completed);
    let (code, _) = console
        .exchange(session_id, netfn::APP, command::CLOSE_SESSION, &close_data)
        .await;
    assert_eq!(code, CompletionCode::Completed);

    assert_eq!(
        hypervisor.calls(),
        vec!["power_on:guest-01", "power_state:guest-01"]
    );

    bmc.stop().await.expect("stop");
}

#[tokio::test]
async fn power_cycle_hits_the_hypervisor_in_order() {
    let hypervisor = Arc::new(RecordingHypervisor::new(PowerState::On));
    let (mut bmc, addr) = start_bmc("guest-02", hypervisor.clone()).await;
    let mut console = Console::connect(addr).await;

    let (code, _) = console
        .exchange(0, netfn::CHASSIS, command::CHASSIS_CONTROL, &[0x02])
        .await;
    assert_eq!(code, CompletionCode::Completed);
    assert_eq!(
        hypervisor.calls(),
        vec!["power_off:guest-02", "power_on:guest-02"]
    );

    bmc.stop().await.expect("stop");
}

#[tokio::test]
async fn reset_failure_maps_to_unspecified_error() {
    let hypervisor = Arc::new(RecordingHypervisor::new(PowerState::Off));
    let (mut bmc, addr) = start_bmc("guest-03", hypervisor.clone()).await;
    let mut console = Console::connect(addr).await;

    let (code, _) = console
        .exchange(0, netfn::CHASSIS, command::CHASSIS_CONTROL, &[0x03])
        .await;
    assert_eq!(code, CompletionCode::Unspecified);

    bmc.stop().await.expect("stop");
}

#[tokio::test]
async fn boot_device_override_reaches_the_hypervisor() {
    let hypervisor = Arc::new(RecordingHypervisor::new(PowerState::Off));
    let (mut bmc, addr) = start_bmc("guest-04", hypervisor.clone()).await;
    let mut console = Console::connect(addr).await;

    // Boot flags parameter selecting PXE.
    let (code, _) = console
        .exchange(
            0,
            netfn::CHASSIS,
            command::SET_SYSTEM_BOOT_OPTIONS,
            &[0x05, 0x80, 0x04],
        )
        .await;
    assert_eq!(code, CompletionCode::Completed);
    assert_eq!(hypervisor.calls(), vec!["set_next_boot:guest-04:pxe"]);

    bmc.stop().await.expect("stop");
}

#[tokio::test]
async fn instances_do_not_share_sessions() {
    let hv_a = Arc::new(RecordingHypervisor::new(PowerState::Off));
    let hv_b = Arc::new(RecordingHypervisor::new(PowerState::Off));
    let (mut bmc_a, addr_a) = start_bmc("guest-a", hv_a.clone()).await;
    let (mut bmc_b, addr_b) = start_bmc("guest-b", hv_b.clone()).await;

    let mut console_a = Console::connect(addr_a).await;
    let mut console_b = Console::connect(addr_b).await;

    // Both endpoints answer independently and route to their own VM.
    let (code_a, _) = console_a
        .exchange(0, netfn::CHASSIS, command::CHASSIS_CONTROL, &[0x01])
        .await;
    let (code_b, _) = console_b
        .exchange(0, netfn::CHASSIS, command::CHASSIS_STATUS, &[])
        .await;
    assert_eq!(code_a, CompletionCode::Completed);
    assert_eq!(code_b, CompletionCode::Completed);
    assert_eq!(hv_a.calls(), vec!["power_on:guest-a"]);
    assert_eq!(hv_b.calls(), vec!["power_state:guest-b"]);

    bmc_a.stop().await.expect("stop a");
    bmc_b.stop().await.expect("stop b");
}

#[tokio::test]
async fn secured_frames_from_unknown_sessions_still_dispatch() {
    let hypervisor = Arc::new(RecordingHypervisor::new(PowerState::Off));
    let (mut bmc, addr) = start_bmc("guest-05", hypervisor.clone()).await;

    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
    socket.connect(addr).await.expect("connect");

    let msg = encode_ipmi_lan_request(netfn::CHASSIS, command::CHASSIS_STATUS, 1, &[])
        .expect("encode request");
    let frame = encode_frame(&Frame::secured(protocol::payload_type::IPMI, 0, 1, msg))
        .expect("encode frame");
    socket.send(&frame).await.expect("send");

    let mut buf = vec![0u8; 1024];
    let len = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .expect("reply within timeout")
        .expect("recv");

    let reply = decode_frame(&buf[..len]).expect("decode");
    assert_eq!(reply.payload[6], CompletionCode::Completed.as_u8());

    bmc.stop().await.expect("stop");
}
