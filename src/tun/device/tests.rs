use super::*;
use tokio::sync::Notify;

const TEST_RING_CAPACITY: usize = 256;

fn make_device() -> (TunDevice, TunHandle) {
    let wake = Arc::new(Notify::new());
    let device = TunDevice::new(DEFAULT_MTU, Arc::clone(&wake), TEST_RING_CAPACITY);
    let handle = device.handle();
    (device, handle)
}

fn make_valid_ipv4_packet(payload_size: usize) -> Vec<u8> {
    let total_len = 20 + payload_size;
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2] = (total_len >> 8) as u8;
    packet[3] = (total_len & 0xFF) as u8;
    packet[8] = 64;
    packet[9] = 6;
    packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
    packet[16..20].copy_from_slice(&[10, 0, 0, 2]);
    for byte in packet.iter_mut().take(total_len).skip(20) {
        *byte = 0x45;
    }
    packet
}

fn make_valid_ipv4_with_tag(tag: u32) -> Vec<u8> {
    let mut packet = make_valid_ipv4_packet(8);
    packet[20..24].copy_from_slice(&tag.to_be_bytes());
    packet
}

#[test]
fn push_inbound_truncates_to_mtu() {
    let (mut device, handle) = make_device();
    let packet = make_valid_ipv4_packet(DEFAULT_MTU + 256 - 20);
    assert!(handle.push_inbound(&packet));

    let (rx, _) = device.receive(Instant::from_millis(0)).expect("rx token missing");
    let mut captured = Vec::new();
    rx.consume(|buffer| captured.extend_from_slice(buffer));
    assert_eq!(captured.len(), DEFAULT_MTU);
}

#[test]
fn outbound_drains_in_order() {
    let (mut device, handle) = make_device();

    let tx1 = device.transmit(Instant::from_millis(0)).unwrap();
    tx1.consume(16, |buffer| buffer.fill(0xAA));
    let tx2 = device.transmit(Instant::from_millis(0)).unwrap();
    tx2.consume(24, |buffer| buffer.fill(0xBB));

    let frames = handle.drain_outbound();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], vec![0xAA; 16]);
    assert_eq!(frames[1], vec![0xBB; 24]);
    assert!(handle.drain_outbound().is_empty());
}

#[test]
fn push_outbound_bypasses_smoltcp_layer() {
    let (_device, handle) = make_device();
    handle.push_outbound(vec![1, 2, 3]);
    assert_eq!(handle.drain_outbound(), vec![vec![1, 2, 3]]);
}

#[test]
fn inbound_ring_evicts_oldest_when_full() {
    let (mut device, handle) = make_device();
    for idx in 0..=TEST_RING_CAPACITY {
        handle.push_inbound(&make_valid_ipv4_with_tag(idx as u32));
    }

    for expected in 1..=TEST_RING_CAPACITY as u32 {
        let (rx, _) = device.receive(Instant::from_millis(0)).expect("rx token missing");
        let mut value = [0u8; 4];
        rx.consume(|buffer| value.copy_from_slice(&buffer[20..24]));
        assert_eq!(u32::from_be_bytes(value), expected);
    }
    assert!(device.receive(Instant::from_millis(0)).is_none());
}
