//! Session tests against a scripted controller

use super::*;
use crate::address::AddressType;
use crate::conn::{Reassembler, Role};
use crate::hci::{AclPacket, BoundaryFlag};
use crate::l2cap::constants::*;
use crate::l2cap::{ConnectionParameterUpdate, L2capError, SignalingMessage};
use crate::smp::{Bond, SecurityLevel, SmpError};
use crate::testing::*;
use crossbeam_channel::unbounded;
use std::thread;
use std::time::Instant;

const HANDLE: u16 = 0x0040;

fn test_config() -> Config {
    Config {
        command_timeout: Duration::from_secs(2),
        dial_timeout: Duration::from_secs(2),
        signaling_timeout: Duration::from_secs(2),
        acl_buffer_timeout: Duration::from_secs(1),
        ..Config::default()
    }
}

fn open_with(config: Config) -> (Arc<FakeController>, Session) {
    let (controller, transport) = FakeController::new();
    let session = Session::open(transport, config).unwrap();
    (controller, session)
}

fn open() -> (Arc<FakeController>, Session) {
    open_with(test_config())
}

fn peer() -> Address {
    Address::public(PEER_BD_ADDR)
}

fn connect_central(controller: &Arc<FakeController>, session: &Session, handle: u16) -> Arc<Connection> {
    let responder = {
        let controller = controller.clone();
        thread::spawn(move || {
            controller
                .expect_command(OP_LE_CREATE_CONNECTION, WAIT)
                .expect("LE Create Connection");
            controller.connection_complete(handle, ROLE_CENTRAL, PEER_BD_ADDR);
        })
    };
    let conn = session.dial(peer(), None).unwrap();
    responder.join().unwrap();
    conn
}

fn connect_peripheral(controller: &FakeController, session: &Session, handle: u16) -> Arc<Connection> {
    controller.connection_complete(handle, ROLE_PERIPHERAL, PEER_BD_ADDR);
    session.accept(Some(WAIT)).unwrap()
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

fn signal(controller: &FakeController) -> SignalingMessage {
    let payload = controller
        .expect_pdu_on(L2CAP_LE_SIGNALING_CID, WAIT)
        .expect("signaling PDU");
    SignalingMessage::parse(&payload).unwrap()
}

#[test]
fn test_initialization() {
    let (controller, session) = open();
    let opcodes = controller.opcodes();
    assert_eq!(
        &opcodes[..5],
        &[
            OP_RESET,
            HciCommand::ReadBdAddr.opcode(),
            HciCommand::LeReadBufferSize.opcode(),
            HciCommand::SetEventMask { event_mask: 0 }.opcode(),
            HciCommand::LeSetEventMask { event_mask: 0 }.opcode(),
        ]
    );
    assert_eq!(session.local_address(), Address::public(LOCAL_BD_ADDR));
    assert_eq!(session.shared.ctx.acl_mtu(), ACL_MTU as usize);
    assert_eq!(session.shared.ctx.pool.capacity(), ACL_BUFFERS as usize);
    assert!(!session.is_closed());
}

#[test]
fn test_buffer_size_fallback() {
    let (controller, transport) = FakeController::new();
    // No dedicated LE buffers: fall back to Read Buffer Size
    controller.set_return(HciCommand::LeReadBufferSize.opcode(), vec![HCI_SUCCESS, 0, 0, 0]);
    controller.set_return(
        HciCommand::ReadBufferSize.opcode(),
        vec![HCI_SUCCESS, 0xFB, 0x00, 0x40, 0x06, 0x00, 0x00, 0x00],
    );
    let session = Session::open(transport, test_config()).unwrap();
    assert_eq!(session.shared.ctx.acl_mtu(), 251);
    assert_eq!(session.shared.ctx.pool.capacity(), 6);
}

#[test]
fn test_command_failure() {
    let (controller, session) = open();
    let command = HciCommand::new(OGF_VENDOR, 0x0001, vec![]);
    controller.set_return(command.opcode(), vec![0x0C]);
    match session.send(command) {
        Err(Error::Hci(HciError::CommandFailed { status: 0x0C, .. })) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert!(!session.is_closed());
}

#[test]
fn test_command_timeout_closes_session() {
    let (controller, session) = open_with(Config {
        command_timeout: Duration::from_millis(200),
        ..test_config()
    });
    let command = HciCommand::new(OGF_VENDOR, 0x0002, vec![]);
    controller.silence(command.opcode());
    match session.send(command) {
        Err(Error::Hci(HciError::CommandTimeout { .. })) => {}
        other => panic!("unexpected {:?}", other),
    }
    wait_for("session close", || session.is_closed());
    assert!(matches!(session.send(HciCommand::Reset), Err(Error::Closed)));
}

#[test]
fn test_same_opcode_serialized() {
    let (controller, session) = open();
    let session = Arc::new(session);
    let command = HciCommand::new(OGF_VENDOR, 0x0003, vec![]);
    let opcode = command.opcode();
    controller.hold(opcode);

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let session = session.clone();
            let command = command.clone();
            thread::spawn(move || session.send(command))
        })
        .collect();

    controller.expect_command(opcode, WAIT).expect("first command");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(controller.count(opcode), 1);

    controller.command_complete(opcode, &[HCI_SUCCESS]);
    controller.expect_command(opcode, WAIT).expect("second command");
    controller.command_complete(opcode, &[HCI_SUCCESS]);

    for caller in callers {
        assert!(caller.join().unwrap().is_ok());
    }
    assert_eq!(controller.count(opcode), 2);
}

#[test]
fn test_dial() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);
    assert_eq!(conn.handle(), HANDLE);
    assert_eq!(conn.role(), Role::Central);
    assert_eq!(conn.peer_address(), peer());
    assert_eq!(conn.peer_address_type(), AddressType::Public);
    assert_eq!(conn.interval(), 0x0028);
    assert_eq!(conn.tx_mtu(), L2CAP_LE_DEFAULT_MTU);
    assert!(session.connection(HANDLE).is_some());
    assert_eq!(session.connections().len(), 1);
}

#[test]
fn test_dial_failure_status() {
    let (controller, session) = open();
    let responder = {
        let controller = controller.clone();
        thread::spawn(move || {
            controller.expect_command(OP_LE_CREATE_CONNECTION, WAIT).unwrap();
            let mut params = vec![0x3E];
            params.extend_from_slice(&[0u8; 17]);
            controller.le_event(EVT_LE_CONN_COMPLETE, &params);
        })
    };
    match session.dial(peer(), None) {
        Err(Error::Hci(HciError::CommandFailed { status: 0x3E, .. })) => {}
        other => panic!("unexpected {:?}", other),
    }
    responder.join().unwrap();
}

#[test]
fn test_dial_timeout_cancels() {
    let (controller, session) = open();
    let session = Arc::new(session);
    let dialing = {
        let session = session.clone();
        thread::spawn(move || session.dial(peer(), Some(Duration::from_millis(300))))
    };
    controller.expect_command(OP_LE_CREATE_CONNECTION, WAIT).unwrap();
    assert!(matches!(session.dial(peer(), None), Err(Error::Busy("dial"))));

    assert!(matches!(dialing.join().unwrap(), Err(Error::DialTimeout)));
    assert!(controller
        .expect_command(HciCommand::LeCreateConnectionCancel.opcode(), WAIT)
        .is_some());

    // A connection completing after the deadline is not leaked
    controller.connection_complete(HANDLE, ROLE_CENTRAL, PEER_BD_ADDR);
    let disconnect = controller.expect_command(OP_DISCONNECT, WAIT).unwrap();
    assert_eq!(&disconnect[..2], &HANDLE.to_le_bytes());
    wait_for("table cleanup", || session.connection(HANDLE).is_none());
}

#[test]
fn test_accept_and_readvertise() {
    let (controller, session) = open();
    assert!(matches!(
        session.accept(Some(Duration::from_millis(50))),
        Err(Error::Timeout { op: "accept" })
    ));

    let enable = HciCommand::LeSetAdvertisingEnable { enable: true }.opcode();
    session.start_advertising(None).unwrap();
    assert_eq!(controller.expect_command(enable, WAIT).unwrap(), vec![1]);
    assert!(session.is_advertising());

    let conn = connect_peripheral(&controller, &session, 0x0041);
    assert_eq!(conn.role(), Role::Peripheral);

    controller.disconnection_complete(0x0041, HCI_REMOTE_USER_TERMINATED);
    assert!(conn.disconnected().recv_timeout(WAIT).is_err());
    assert!(conn.is_closed());
    assert_eq!(controller.expect_command(enable, WAIT).unwrap(), vec![1]);
    assert!(session.connection(0x0041).is_none());

    session.stop_advertising().unwrap();
    assert!(!session.is_advertising());
}

#[test]
fn test_advertising_data_limit() {
    let (_controller, session) = open();
    assert!(matches!(
        session.set_advertising_data(&[0u8; 32], &[]),
        Err(Error::InvalidParameter(_))
    ));
    session.set_advertising_data(&[0x02, 0x01, 0x06], &[]).unwrap();
}

#[test]
fn test_advertising_reports() {
    let (controller, session) = open();
    let (tx, rx) = unbounded();
    session.set_advertisement_handler(move |adv| {
        let _ = tx.send(adv.clone());
    });
    session.start_scan(None).unwrap();

    let mut params = vec![1, 0x00, 0x01];
    params.extend_from_slice(&PEER_BD_ADDR);
    params.extend_from_slice(&[3, 0x02, 0x01, 0x06]);
    params.push(0xC4);
    controller.le_event(EVT_LE_ADVERTISING_REPORT, &params);

    let adv = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(adv.address, Address::random(PEER_BD_ADDR));
    assert_eq!(adv.data, vec![0x02, 0x01, 0x06]);
    assert_eq!(adv.rssi, -60);
    session.stop_scan().unwrap();
}

#[test]
fn test_close_unblocks_read() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);
    let reader = {
        let conn = conn.clone();
        thread::spawn(move || conn.read())
    };
    thread::sleep(Duration::from_millis(50));
    session.close();

    assert!(matches!(
        reader.join().unwrap(),
        Err(Error::L2cap(L2capError::ConnectionTerminated))
    ));
    assert!(conn.read().is_err());
    assert!(conn.write(&[1]).is_err());
    assert!(session.is_closed());
    assert!(matches!(session.dial(peer(), None), Err(Error::Closed)));
    // Idempotent
    session.close();
}

#[test]
fn test_connection_close() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);
    conn.close().unwrap();
    assert!(conn.is_closed());
    assert!(controller.expect_command(OP_DISCONNECT, WAIT).is_some());
    wait_for("table cleanup", || session.connection(HANDLE).is_none());
    assert!(conn.close().is_ok());
}

#[test]
fn test_start_encryption_with_bond() {
    let (controller, session) = open();
    let bond = Bond::new([0x5A; 16], 0x1234, [7; 8], true);
    let store = Arc::new(MemoryBondStore::new());
    store.save(&peer(), &bond).unwrap();
    session.set_bond_store(store);

    let conn = connect_central(&controller, &session, HANDLE);
    let encrypting = {
        let conn = conn.clone();
        thread::spawn(move || conn.start_encryption(WAIT))
    };
    let params = controller.expect_command(OP_LE_START_ENCRYPTION, WAIT).unwrap();
    assert_eq!(&params[..2], &HANDLE.to_le_bytes());
    assert_eq!(&params[12..28], &[0x5A; 16]);
    controller.encryption_change(HANDLE, HCI_SUCCESS, true);

    assert_eq!(encrypting.join().unwrap().unwrap(), SecurityLevel::EncryptionOnly);
    assert!(conn.is_encrypted());

    // Already encrypted: answered without touching the controller
    assert_eq!(conn.start_encryption(WAIT).unwrap(), SecurityLevel::EncryptionOnly);
    assert_eq!(controller.count(OP_LE_START_ENCRYPTION), 1);
}

#[test]
fn test_start_encryption_failure() {
    let (controller, session) = open();
    let store = Arc::new(MemoryBondStore::new());
    store.save(&peer(), &Bond::new([1; 16], 1, [1; 8], true)).unwrap();
    session.set_bond_store(store);

    let conn = connect_central(&controller, &session, HANDLE);
    let encrypting = {
        let conn = conn.clone();
        thread::spawn(move || conn.start_encryption(WAIT))
    };
    controller.expect_command(OP_LE_START_ENCRYPTION, WAIT).unwrap();
    controller.encryption_change(HANDLE, 0x06, false);
    match encrypting.join().unwrap() {
        Err(Error::Smp(SmpError::EncryptionFailed(0x06))) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert!(!conn.is_encrypted());
}

#[test]
fn test_start_encryption_without_bond() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);
    assert!(matches!(
        conn.start_encryption(WAIT),
        Err(Error::Smp(SmpError::NotPaired))
    ));
}

#[test]
fn test_ltk_request() {
    let (controller, session) = open();
    let bond = Bond::new([0x33; 16], 0xBEEF, [9; 8], true);
    let store = Arc::new(MemoryBondStore::new());
    store.save(&peer(), &bond).unwrap();
    session.set_bond_store(store);
    connect_peripheral(&controller, &session, HANDLE);

    let mut params = HANDLE.to_le_bytes().to_vec();
    params.extend_from_slice(&[9; 8]);
    params.extend_from_slice(&0xBEEFu16.to_le_bytes());
    controller.le_event(EVT_LE_LTK_REQUEST, &params);

    let reply = controller
        .expect_command(opcode(OGF_LE, OCF_LE_LTK_REQUEST_REPLY), WAIT)
        .unwrap();
    assert_eq!(&reply[..2], &HANDLE.to_le_bytes());
    assert_eq!(&reply[2..], &[0x33; 16]);

    // Unknown handle gets a negative reply
    let mut params = 0x0099u16.to_le_bytes().to_vec();
    params.extend_from_slice(&[0; 10]);
    controller.le_event(EVT_LE_LTK_REQUEST, &params);
    let negative = controller
        .expect_command(opcode(OGF_LE, OCF_LE_LTK_REQUEST_NEGATIVE_REPLY), WAIT)
        .unwrap();
    assert_eq!(negative, 0x0099u16.to_le_bytes().to_vec());
}

#[test]
fn test_write_fragments() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);
    conn.set_tx_mtu(100);

    assert_eq!(conn.write(&[0x55; 60]).unwrap(), 60);
    let fragments: Vec<AclPacket> = (0..3).map(|_| controller.expect_acl(WAIT).unwrap()).collect();
    assert_eq!(fragments[0].header.boundary, BoundaryFlag::FirstNonFlushable);
    assert_eq!(fragments[1].header.boundary, BoundaryFlag::Continuing);
    assert_eq!(fragments[2].header.boundary, BoundaryFlag::Continuing);
    let sizes: Vec<usize> = fragments.iter().map(|f| f.data.len()).collect();
    assert_eq!(sizes, vec![27, 27, 10]);
    assert_eq!(&fragments[0].data[..4], &[60, 0, 0x04, 0x00]);

    // Buffers come back once the controller reports them completed
    wait_for("buffer release", || session.shared.ctx.pool.available() == ACL_BUFFERS as usize);
}

#[test]
fn test_write_splits_at_mtu() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);
    conn.write(&[0xAA; 50]).unwrap();
    let sizes: Vec<usize> = (0..3)
        .map(|_| controller.expect_pdu_on(L2CAP_ATT_CID, WAIT).unwrap().len())
        .collect();
    assert_eq!(sizes, vec![23, 23, 4]);
}

#[test]
fn test_write_waits_for_buffers() {
    let (controller, session) = open_with(Config {
        acl_buffer_timeout: Duration::from_millis(100),
        ..test_config()
    });
    controller.set_auto_complete(false);
    let conn = connect_central(&controller, &session, HANDLE);
    conn.set_tx_mtu(200);
    let pool = &session.shared.ctx.pool;

    // Three fragments, leaving one buffer
    conn.write(&[1; 60]).unwrap();
    for _ in 0..3 {
        controller.expect_acl(WAIT).unwrap();
    }

    // A second three-fragment PDU cannot start, and nothing of it is sent
    match conn.write(&[2; 60]) {
        Err(Error::L2cap(L2capError::NoBuffer)) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert!(controller.expect_acl(Duration::from_millis(50)).is_none());
    assert_eq!(pool.in_flight(HANDLE), 3);
    assert_eq!(pool.available(), 1);

    controller.completed_packets(HANDLE, 3);
    wait_for("buffer release", || pool.available() == ACL_BUFFERS as usize);
    conn.write(&[3; 60]).unwrap();
    let mut peer = Reassembler::new(HANDLE);
    let mut pdu = None;
    for _ in 0..3 {
        pdu = peer.push(&controller.expect_acl(WAIT).unwrap()).unwrap();
    }
    assert_eq!(pdu.unwrap().payload, vec![3; 60]);
}

#[test]
fn test_write_larger_than_pool() {
    let (controller, session) = open_with(Config {
        acl_buffer_timeout: Duration::from_millis(100),
        ..test_config()
    });
    controller.set_auto_complete(false);
    let conn = connect_central(&controller, &session, HANDLE);
    conn.set_tx_mtu(200);

    // Seven fragments against four buffers
    let writer = {
        let conn = conn.clone();
        thread::spawn(move || conn.write(&[9; 180]))
    };
    let mut peer = Reassembler::new(HANDLE);
    for _ in 0..ACL_BUFFERS {
        assert_eq!(peer.push(&controller.expect_acl(WAIT).unwrap()).unwrap(), None);
    }

    // Once started, the PDU waits past the buffer timeout for completions
    thread::sleep(Duration::from_millis(200));
    assert!(controller.expect_acl(Duration::ZERO).is_none());
    controller.completed_packets(HANDLE, ACL_BUFFERS as u16);

    let mut pdu = None;
    for _ in 0..3 {
        pdu = peer.push(&controller.expect_acl(WAIT).unwrap()).unwrap();
    }
    assert_eq!(writer.join().unwrap().unwrap(), 180);
    assert_eq!(pdu.unwrap().payload, vec![9; 180]);
    assert!(peer.is_idle());
}

#[test]
fn test_write_fails_when_link_drops_mid_pdu() {
    let (controller, session) = open();
    controller.set_auto_complete(false);
    let conn = connect_central(&controller, &session, HANDLE);
    conn.set_tx_mtu(200);

    let writer = {
        let conn = conn.clone();
        thread::spawn(move || conn.write(&[9; 180]))
    };
    for _ in 0..ACL_BUFFERS {
        controller.expect_acl(WAIT).unwrap();
    }
    controller.disconnection_complete(HANDLE, 0x08);
    assert!(matches!(
        writer.join().unwrap(),
        Err(Error::L2cap(L2capError::ConnectionTerminated))
    ));
    wait_for("buffer reclaim", || session.shared.ctx.pool.available() == ACL_BUFFERS as usize);
}

#[test]
fn test_inbound_fragments_to_read() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);
    let payload: Vec<u8> = (0..40).collect();
    controller.pdu(HANDLE, L2CAP_ATT_CID, &payload, 10);
    assert_eq!(conn.read_timeout(WAIT).unwrap(), payload);
    assert!(matches!(
        conn.read_timeout(Duration::from_millis(20)),
        Err(Error::Timeout { op: "read" })
    ));
}

#[test]
fn test_framing_error_drops_link() {
    let (controller, session) = open();
    let (tx, rx) = unbounded();
    session.set_error_handler(move |err| {
        if matches!(err, Error::L2cap(L2capError::Framing { .. })) {
            let _ = tx.send(());
        }
    });
    let conn = connect_central(&controller, &session, HANDLE);

    controller.acl(HANDLE, BoundaryFlag::Continuing, &[1, 2, 3]);
    rx.recv_timeout(WAIT).expect("framing error reported");
    let disconnect = controller.expect_command(OP_DISCONNECT, WAIT).unwrap();
    assert_eq!(&disconnect[..2], &HANDLE.to_le_bytes());
    wait_for("link teardown", || conn.is_closed());
    wait_for("table cleanup", || session.connection(HANDLE).is_none());
    assert!(!session.is_closed());
}

#[test]
fn test_coc_open_send_receive() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);

    let opening = {
        let conn = conn.clone();
        thread::spawn(move || conn.coc_open(0x0080, None, WAIT))
    };
    let SignalingMessage::LeCreditBasedConnectionRequest {
        identifier,
        le_psm,
        source_cid,
        mtu,
        ..
    } = signal(&controller)
    else {
        panic!("expected a credit based connection request");
    };
    assert_eq!(le_psm, 0x0080);
    assert_eq!(mtu, L2CAP_LE_COC_DEFAULT_MTU);
    let response = SignalingMessage::LeCreditBasedConnectionResponse {
        identifier,
        destination_cid: 0x0050,
        mtu: 100,
        mps: 50,
        initial_credits: 2,
        result: L2CAP_LE_CONN_SUCCESSFUL,
    };
    controller.pdu(HANDLE, L2CAP_LE_SIGNALING_CID, &response.serialize(), ACL_MTU as usize);

    let info = opening.join().unwrap().unwrap();
    assert_eq!(info.local_cid, source_cid);
    assert_eq!(info.remote_cid, 0x0050);
    assert_eq!(info.send_credits, 2);

    // 60 bytes over an MPS of 50: two K-frames, two credits
    conn.coc_send(info.local_cid, &[7; 60]).unwrap();
    let first = controller.expect_pdu_on(0x0050, WAIT).unwrap();
    let second = controller.expect_pdu_on(0x0050, WAIT).unwrap();
    assert_eq!(first.len(), 50);
    assert_eq!(&first[..2], &60u16.to_le_bytes());
    assert_eq!(second.len(), 12);
    assert_eq!(conn.coc_info(info.local_cid).unwrap().send_credits, 0);
    assert!(matches!(
        conn.coc_send(info.local_cid, &[0; 101]),
        Err(Error::L2cap(L2capError::MtuExceeded { .. }))
    ));

    let inbound = conn.coc_subscribe(info.local_cid).unwrap();
    controller.pdu(HANDLE, info.local_cid, &[4, 0, 1, 2, 3, 4], ACL_MTU as usize);
    assert_eq!(inbound.recv_timeout(WAIT).unwrap(), vec![1, 2, 3, 4]);
    match signal(&controller) {
        SignalingMessage::LeFlowControlCredit { cid, credits, .. } => {
            assert_eq!(cid, info.local_cid);
            assert_eq!(credits, 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    conn.coc_unsubscribe(info.local_cid).unwrap();
    assert!(inbound.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(matches!(
        conn.coc_unsubscribe(0x7FFF),
        Err(Error::L2cap(L2capError::ChannelNotFound(0x7FFF)))
    ));

    // ATT MTUs never drop below the LE default
    conn.set_rx_mtu(10);
    assert_eq!(conn.rx_mtu(), L2CAP_LE_DEFAULT_MTU);
    conn.set_tx_mtu(185);
    assert_eq!(conn.tx_mtu(), 185);
}

#[test]
fn test_coc_refused() {
    let (controller, session) = open();
    let conn = connect_central(&controller, &session, HANDLE);
    let opening = {
        let conn = conn.clone();
        thread::spawn(move || conn.coc_open(0x0081, None, WAIT))
    };
    let identifier = signal(&controller).identifier();
    let response = SignalingMessage::LeCreditBasedConnectionResponse {
        identifier,
        destination_cid: 0,
        mtu: 0,
        mps: 0,
        initial_credits: 0,
        result: L2CAP_LE_CONN_PSM_NOT_SUPPORTED,
    };
    controller.pdu(HANDLE, L2CAP_LE_SIGNALING_CID, &response.serialize(), ACL_MTU as usize);
    assert!(matches!(
        opening.join().unwrap(),
        Err(Error::L2cap(L2capError::ConnectionRefused(L2CAP_LE_CONN_PSM_NOT_SUPPORTED)))
    ));
}

#[test]
fn test_incoming_coc_request_refused() {
    let (controller, session) = open();
    let _conn = connect_central(&controller, &session, HANDLE);
    let request = SignalingMessage::LeCreditBasedConnectionRequest {
        identifier: 3,
        le_psm: 0x0080,
        source_cid: 0x0045,
        mtu: 64,
        mps: 64,
        initial_credits: 1,
    };
    controller.pdu(HANDLE, L2CAP_LE_SIGNALING_CID, &request.serialize(), ACL_MTU as usize);
    match signal(&controller) {
        SignalingMessage::LeCreditBasedConnectionResponse { identifier, result, .. } => {
            assert_eq!(identifier, 3);
            assert_eq!(result, L2CAP_LE_CONN_PSM_NOT_SUPPORTED);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_parameter_update_request() {
    let (controller, session) = open();
    let _conn = connect_central(&controller, &session, HANDLE);
    let request = SignalingMessage::ConnectionParameterUpdateRequest {
        identifier: 7,
        params: ConnectionParameterUpdate {
            conn_interval_min: 0x0010,
            conn_interval_max: 0x0020,
            conn_latency: 0,
            supervision_timeout: 0x0100,
        },
    };
    controller.pdu(HANDLE, L2CAP_LE_SIGNALING_CID, &request.serialize(), ACL_MTU as usize);

    match signal(&controller) {
        SignalingMessage::ConnectionParameterUpdateResponse { identifier, result } => {
            assert_eq!(identifier, 7);
            assert_eq!(result, L2CAP_CONN_PARAM_ACCEPTED);
        }
        other => panic!("unexpected {:?}", other),
    }
    let update = controller
        .expect_command(opcode(OGF_LE, OCF_LE_CONNECTION_UPDATE), WAIT)
        .unwrap();
    assert_eq!(&update[..2], &HANDLE.to_le_bytes());
    assert_eq!(&update[2..4], &0x0010u16.to_le_bytes());
    assert_eq!(&update[4..6], &0x0020u16.to_le_bytes());
}

#[test]
fn test_parameter_update_from_peripheral() {
    let (controller, session) = open();
    let conn = connect_peripheral(&controller, &session, HANDLE);
    let params = ConnectionParameterUpdate {
        conn_interval_min: 0x0018,
        conn_interval_max: 0x0028,
        conn_latency: 0,
        supervision_timeout: 0x01F4,
    };
    let requesting = {
        let conn = conn.clone();
        thread::spawn(move || conn.request_parameter_update(params, WAIT))
    };
    let identifier = match signal(&controller) {
        SignalingMessage::ConnectionParameterUpdateRequest { identifier, params: sent } => {
            assert_eq!(sent, params);
            identifier
        }
        other => panic!("unexpected {:?}", other),
    };
    let response = SignalingMessage::ConnectionParameterUpdateResponse {
        identifier,
        result: L2CAP_CONN_PARAM_REJECTED,
    };
    controller.pdu(HANDLE, L2CAP_LE_SIGNALING_CID, &response.serialize(), ACL_MTU as usize);
    assert!(matches!(
        requesting.join().unwrap(),
        Err(Error::L2cap(L2capError::ParameterUpdateRejected))
    ));
}

#[test]
fn test_unknown_signaling_rejected() {
    let (controller, session) = open();
    let _conn = connect_central(&controller, &session, HANDLE);
    controller.pdu(HANDLE, L2CAP_LE_SIGNALING_CID, &[0x7E, 0x05, 0x00, 0x00], ACL_MTU as usize);
    match signal(&controller) {
        SignalingMessage::CommandReject { identifier, reason, .. } => {
            assert_eq!(identifier, 5);
            assert_eq!(reason, L2CAP_REJECT_NOT_UNDERSTOOD);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_unknown_channel_disconnect_rejected() {
    let (controller, session) = open();
    let _conn = connect_central(&controller, &session, HANDLE);
    let request = SignalingMessage::DisconnectionRequest {
        identifier: 9,
        destination_cid: 0x0077,
        source_cid: 0x0055,
    };
    controller.pdu(HANDLE, L2CAP_LE_SIGNALING_CID, &request.serialize(), ACL_MTU as usize);
    match signal(&controller) {
        SignalingMessage::CommandReject { identifier, reason, data } => {
            assert_eq!(identifier, 9);
            assert_eq!(reason, L2CAP_REJECT_INVALID_CID);
            assert_eq!(data, vec![0x77, 0x00, 0x55, 0x00]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_vendor_event_reported() {
    let (controller, session) = open();
    let (tx, rx) = unbounded();
    session.set_error_handler(move |err| {
        if let Error::VendorEvent(data) = err {
            let _ = tx.send(data.clone());
        }
    });
    controller.event(EVT_VENDOR, vec![1, 2, 3]);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![1, 2, 3]);
    assert!(!session.is_closed());
}

#[test]
fn test_transport_eof_closes_session() {
    let (controller, session) = open();
    let (tx, rx) = unbounded();
    session.set_error_handler(move |err| {
        if matches!(err, Error::Hci(HciError::Eof)) {
            let _ = tx.send(());
        }
    });
    let conn = connect_central(&controller, &session, HANDLE);

    controller.stop();
    drop(controller);
    rx.recv_timeout(WAIT).expect("end of stream reported");
    wait_for("session close", || session.is_closed());
    assert!(conn.is_closed());
    assert!(matches!(
        conn.read(),
        Err(Error::L2cap(L2capError::ConnectionTerminated))
    ));
}
