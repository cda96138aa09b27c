//! Unit tests for H4 framing

use super::*;
use crate::error::HciError;

#[test]
fn test_reader_splits_back_to_back_packets() {
    let mut reader = PacketReader::new();
    // Command Complete for Reset followed by a one-byte ACL fragment
    reader.push(&[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
    reader.push(&[0x02, 0x40, 0x20, 0x01, 0x00, 0xAA]);

    let first = reader.next_packet().unwrap().unwrap();
    assert_eq!(first, vec![0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);

    let second = reader.next_packet().unwrap().unwrap();
    assert_eq!(second, vec![0x02, 0x40, 0x20, 0x01, 0x00, 0xAA]);

    assert!(reader.next_packet().unwrap().is_none());
}

#[test]
fn test_reader_waits_for_partial_packet() {
    let packet = [0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13];
    let mut reader = PacketReader::new();

    for (i, byte) in packet.iter().enumerate() {
        reader.push(&[*byte]);
        let next = reader.next_packet().unwrap();
        if i + 1 < packet.len() {
            assert!(next.is_none(), "packet yielded after {} bytes", i + 1);
        } else {
            assert_eq!(next.unwrap(), packet.to_vec());
        }
    }
}

#[test]
fn test_reader_resynchronises_after_garbage() {
    let mut reader = PacketReader::new();
    reader.push(&[0x7F, 0x04, 0x10, 0x01, 0x03]);

    match reader.next_packet() {
        Err(HciError::UnknownPacketType(0x7F)) => {}
        other => panic!("expected unknown packet type, got {:?}", other),
    }
    assert_eq!(reader.next_packet().unwrap().unwrap(), vec![0x04, 0x10, 0x01, 0x03]);
}

#[test]
fn test_reader_iso_length_uses_fourteen_bits() {
    let mut reader = PacketReader::new();
    // Upper two bits of the length field are reserved
    reader.push(&[0x05, 0x01, 0x00, 0x02, 0xC0, 0x11, 0x22]);
    assert_eq!(reader.next_packet().unwrap().unwrap().len(), 7);
}

#[test]
fn test_idle_errors() {
    assert!(is_idle(&io::Error::new(io::ErrorKind::TimedOut, "t")));
    assert!(is_idle(&io::Error::new(io::ErrorKind::WouldBlock, "w")));
    assert!(!is_idle(&io::Error::new(io::ErrorKind::BrokenPipe, "b")));
}
