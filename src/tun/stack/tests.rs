use super::*;

fn empty_entry() -> FlowEntry {
    let mut sockets = SocketSet::new(Vec::new());
    let socket = TcpSocket::new(TcpSocketBuffer::new(vec![0; 256]), TcpSocketBuffer::new(vec![0; 256]));
    let handle = sockets.add(socket);
    FlowEntry { socket: handle, state: FlowState::PendingDial, buffered: Vec::new(), buffered_bytes: 0 }
}

#[test]
fn buffer_payload_rejects_past_count_limit() {
    let mut entry = empty_entry();
    for _ in 0..MAX_BUFFERED_PAYLOADS {
        assert!(buffer_payload(&mut entry, b"x"));
    }
    assert!(!buffer_payload(&mut entry, b"overflow"));
    assert_eq!(entry.buffered.len(), MAX_BUFFERED_PAYLOADS);
}

#[test]
fn buffer_payload_rejects_past_byte_limit() {
    let mut entry = empty_entry();
    let chunk = vec![0u8; MAX_BUFFERED_BYTES];
    assert!(buffer_payload(&mut entry, &chunk));
    assert!(!buffer_payload(&mut entry, b"one more byte tips it over"));
}

#[test]
fn to_smoltcp_addr_round_trips_ipv4() {
    let ip: IpAddr = "198.18.0.1".parse().unwrap();
    match to_smoltcp_addr(ip) {
        IpAddress::Ipv4(addr) => assert_eq!(addr.0, [198u8, 18, 0, 1]),
        _ => panic!("expected ipv4"),
    }
}
