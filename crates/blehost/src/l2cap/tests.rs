//! Tests for the L2CAP implementation

use super::coc::*;
use super::constants::*;
use super::packet::*;
use super::signaling::*;
use super::types::*;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn channel_info(local_cid: u16, remote_cid: u16, credits: u16) -> CocChannelInfo {
    CocChannelInfo {
        psm: 0x0080,
        local_cid,
        remote_cid,
        local_mtu: 512,
        local_mps: 64,
        remote_mtu: 512,
        remote_mps: 23,
        send_credits: credits,
    }
}

#[test]
fn test_l2cap_header() {
    let header = L2capHeader::new(10, 0x0040);
    let bytes = header.to_bytes();
    assert_eq!(bytes, [10, 0, 0x40, 0]);
    assert_eq!(L2capHeader::parse(&bytes).unwrap(), header);
    assert!(L2capHeader::parse(&bytes[..3]).is_none());
}

#[test]
fn test_l2cap_packet() {
    let packet = L2capPacket::new(L2CAP_ATT_CID, vec![1, 2, 3, 4]);
    let bytes = packet.to_bytes();
    assert_eq!(&bytes[..4], &[4, 0, 0x04, 0]);
    assert_eq!(L2capPacket::parse(&bytes).unwrap(), packet);

    // Declared length disagrees with the payload
    assert!(L2capPacket::parse(&[5, 0, 0x04, 0, 1, 2]).is_err());
}

#[test]
fn test_segment_sdu_prefixes_only_first_frame() {
    let sdu: Vec<u8> = (0..50).collect();
    let frames = segment_sdu(&sdu, 23).unwrap();

    // 21 bytes per frame after reserving the length field
    assert_eq!(frames.len(), 3);
    assert_eq!(&frames[0][..2], &[50, 0]);
    assert_eq!(&frames[0][2..], &sdu[..21]);
    assert_eq!(frames[1], sdu[21..42].to_vec());
    assert_eq!(frames[2], sdu[42..].to_vec());
    assert!(frames.iter().all(|f| f.len() <= 23));

    // Empty SDUs still carry the length field
    assert_eq!(segment_sdu(&[], 23).unwrap(), vec![vec![0, 0]]);
    assert!(segment_sdu(&sdu, 2).is_err());
}

#[test]
fn test_signaling_round_trip() {
    let messages = vec![
        SignalingMessage::CommandReject {
            identifier: 3,
            reason: L2CAP_REJECT_NOT_UNDERSTOOD,
            data: vec![],
        },
        SignalingMessage::ConnectionParameterUpdateRequest {
            identifier: 7,
            params: ConnectionParameterUpdate {
                conn_interval_min: 6,
                conn_interval_max: 12,
                conn_latency: 0,
                supervision_timeout: 100,
            },
        },
        SignalingMessage::LeCreditBasedConnectionRequest {
            identifier: 9,
            le_psm: 0x0080,
            source_cid: 0x0040,
            mtu: 512,
            mps: 247,
            initial_credits: 10,
        },
        SignalingMessage::LeFlowControlCredit {
            identifier: 10,
            cid: 0x0041,
            credits: 1,
        },
    ];
    for message in messages {
        let bytes = message.serialize();
        assert_eq!(bytes[0], message.command_code());
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]) as usize, bytes.len() - 4);
        assert_eq!(SignalingMessage::parse(&bytes).unwrap(), message);
    }
}

#[test]
fn test_signaling_credit_response_layout() {
    let bytes = [
        L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE,
        0x02,
        10,
        0,
        0x45,
        0x00,
        0x00,
        0x02,
        0x40,
        0x00,
        0x05,
        0x00,
        0x00,
        0x00,
    ];
    match SignalingMessage::parse(&bytes).unwrap() {
        SignalingMessage::LeCreditBasedConnectionResponse {
            identifier,
            destination_cid,
            mtu,
            mps,
            initial_credits,
            result,
        } => {
            assert_eq!(identifier, 2);
            assert_eq!(destination_cid, 0x0045);
            assert_eq!(mtu, 512);
            assert_eq!(mps, 64);
            assert_eq!(initial_credits, 5);
            assert_eq!(result, L2CAP_LE_CONN_SUCCESSFUL);
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[test]
fn test_signaling_unknown_and_truncated() {
    // Echo request is not an LE signaling command
    assert!(matches!(
        SignalingMessage::parse(&[0x08, 0x01, 0x00, 0x00]),
        Err(L2capError::NotSupported)
    ));
    assert!(SignalingMessage::parse(&[L2CAP_LE_FLOW_CONTROL_CREDIT, 1, 4, 0, 0x40]).is_err());
    assert!(SignalingMessage::parse(&[0x01, 0x01]).is_err());
}

#[test]
fn test_signaling_channel_correlates_by_identifier() {
    let signaling = SignalingChannel::new();
    let (first, first_rx) = signaling.begin().unwrap();
    let (second, second_rx) = signaling.begin().unwrap();
    assert_ne!(first, second);
    assert_ne!(first, 0);

    let response = SignalingMessage::ConnectionParameterUpdateResponse {
        identifier: second,
        result: L2CAP_CONN_PARAM_ACCEPTED,
    };
    assert!(signaling.complete(response.clone()));
    assert_eq!(second_rx.try_recv().unwrap(), response);
    assert!(first_rx.try_recv().is_err());

    // A duplicate or unsolicited response has no waiter
    assert!(!signaling.complete(response));

    signaling.close();
    assert!(first_rx.recv().is_err());
}

#[test]
fn test_connection_parameter_validation() {
    let valid = ConnectionParameterUpdate {
        conn_interval_min: 0x0018,
        conn_interval_max: 0x0028,
        conn_latency: 0,
        supervision_timeout: 0x01F4,
    };
    assert!(valid.validate());

    let inverted = ConnectionParameterUpdate {
        conn_interval_min: 0x0028,
        conn_interval_max: 0x0018,
        ..valid
    };
    assert!(!inverted.validate());

    // 100 ms timeout cannot cover 4 s of latency
    let too_short = ConnectionParameterUpdate {
        conn_latency: 99,
        supervision_timeout: 10,
        ..valid
    };
    assert!(!too_short.validate());
}

#[test]
fn test_cid_allocation_and_duplicates() {
    let engine = CocEngine::new(4);
    let first = engine.allocate_cid().unwrap();
    let second = engine.allocate_cid().unwrap();
    assert_eq!(first, L2CAP_LE_DYN_CID_START);
    assert_eq!(second, first + 1);

    engine.register(channel_info(first, 0x0050, 1)).unwrap();
    assert!(matches!(
        engine.register(channel_info(first, 0x0051, 1)),
        Err(L2capError::DuplicateChannel(cid)) if cid == first
    ));
}

#[test]
fn test_cid_allocation_exhausts_range() {
    let engine = CocEngine::new(1);
    let span = (L2CAP_LE_DYN_CID_END - L2CAP_LE_DYN_CID_START + 1) as usize;
    for _ in 0..span {
        let cid = engine.allocate_cid().unwrap();
        engine.register(channel_info(cid, cid, 0)).unwrap();
    }
    assert!(matches!(engine.allocate_cid(), Err(L2capError::ResourceLimitReached)));

    engine.remove(0x0050).unwrap();
    assert_eq!(engine.allocate_cid().unwrap(), 0x0050);
}

#[test]
fn test_unknown_cid_is_an_error() {
    let engine = CocEngine::new(1);
    assert!(matches!(engine.subscribe(0x0040), Err(L2capError::ChannelNotFound(0x0040))));
    assert!(matches!(engine.remove(0x0040), Err(L2capError::ChannelNotFound(_))));
    assert!(matches!(engine.receive(0x0040, &[0, 0]), Err(L2capError::ChannelNotFound(_))));
    assert!(matches!(engine.grant(0x0099, 1), Err(L2capError::ChannelNotFound(_))));
}

#[test]
fn test_credit_exhaustion_fails_after_retries() {
    let engine = CocEngine::new(1);
    engine.register(channel_info(0x0040, 0x0050, 1)).unwrap();

    engine.acquire_credit(0x0040, 3, Duration::from_millis(1)).unwrap();
    assert!(matches!(
        engine.acquire_credit(0x0040, 3, Duration::from_millis(1)),
        Err(L2capError::NoCredits(0x0040))
    ));
}

#[test]
fn test_credit_grant_wakes_waiting_sender() {
    let engine = Arc::new(CocEngine::new(1));
    engine.register(channel_info(0x0040, 0x0050, 0)).unwrap();

    let granter = {
        let engine = engine.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            engine.grant(0x0050, 2).unwrap();
        })
    };

    engine.acquire_credit(0x0040, 8, Duration::from_millis(10)).unwrap();
    granter.join().unwrap();
    assert_eq!(engine.info(0x0040).unwrap().send_credits, 1);
}

#[test]
fn test_credit_overflow_is_rejected() {
    let engine = CocEngine::new(1);
    engine.register(channel_info(0x0040, 0x0050, u16::MAX - 1)).unwrap();
    assert!(matches!(engine.grant(0x0050, 2), Err(L2capError::CreditOverflow(0x0040))));
    assert_eq!(engine.info(0x0040).unwrap().send_credits, u16::MAX - 1);
}

#[test]
fn test_receive_reassembles_sdu() {
    let engine = CocEngine::new(2);
    engine.register(channel_info(0x0040, 0x0050, 0)).unwrap();
    let rx = engine.subscribe(0x0040).unwrap();

    let first = engine.receive(0x0040, &[5, 0, b'h', b'e']).unwrap();
    assert_eq!(first.local_cid, 0x0040);
    assert!(first.sdu.is_none());

    let second = engine.receive(0x0040, b"llo").unwrap();
    let (sdu, subscriber) = second.sdu.unwrap();
    assert_eq!(sdu, b"hello".to_vec());
    subscriber.unwrap().send(sdu).unwrap();
    assert_eq!(rx.recv().unwrap(), b"hello".to_vec());
}

#[test]
fn test_receive_overflow_still_delivers() {
    let engine = CocEngine::new(1);
    engine.register(channel_info(0x0040, 0x0050, 0)).unwrap();

    let received = engine.receive(0x0040, &[2, 0, 1, 2, 3]).unwrap();
    assert_eq!(received.sdu.unwrap().0, vec![1, 2, 3]);

    // The next frame starts a fresh SDU
    let received = engine.receive(0x0040, &[1, 0, 9]).unwrap();
    assert_eq!(received.sdu.unwrap().0, vec![9]);
}

#[test]
fn test_close_releases_subscriber() {
    let engine = CocEngine::new(1);
    engine.register(channel_info(0x0040, 0x0050, 0)).unwrap();
    let rx = engine.subscribe(0x0040).unwrap();
    engine.unsubscribe(0x0040).unwrap();
    assert!(rx.recv().is_err());

    let rx = engine.subscribe(0x0040).unwrap();
    engine.remove(0x0040).unwrap();
    assert!(rx.recv().is_err());

    engine.register(channel_info(0x0041, 0x0051, 0)).unwrap();
    engine.close_all();
    assert!(matches!(
        engine.acquire_credit(0x0041, 1, Duration::from_millis(1)),
        Err(L2capError::ConnectionTerminated)
    ));
}

#[derive(Debug, Clone)]
enum CreditOp {
    Send,
    Grant(u16),
}

fn credit_op() -> impl Strategy<Value = CreditOp> {
    prop_oneof![Just(CreditOp::Send), (0u16..2000).prop_map(CreditOp::Grant)]
}

proptest! {
    #[test]
    fn credits_never_negative_or_above_balance(
        initial in 0u16..100,
        ops in proptest::collection::vec(credit_op(), 0..200),
    ) {
        let mut credits = Credits::new(initial);
        let mut granted = initial as u64;
        let mut consumed = 0u64;

        for op in ops {
            match op {
                CreditOp::Send => {
                    let before = credits.available();
                    if credits.try_take() {
                        consumed += 1;
                        prop_assert_eq!(credits.available(), before - 1);
                    } else {
                        prop_assert_eq!(before, 0);
                    }
                }
                CreditOp::Grant(n) => {
                    if credits.grant(n).is_some() {
                        granted += n as u64;
                    }
                }
            }
            prop_assert_eq!(credits.available() as u64, granted - consumed);
        }
    }
}
