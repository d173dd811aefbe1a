//! Byte-level layout checks for the worker channel header.
//!
//! Worker hosts may be built separately from the parent (the x86 host in
//! particular), so the layout is pinned here rather than derived.

use paperflow_protocol::*;

#[test]
fn test_header_bytes_are_big_endian() {
    let header = Header::new(OpCode::Page, 0x0102_0304_0506_0708, 0x0A0B_0C0D);
    let packed = header.pack().unwrap();

    assert_eq!(packed[0], PROTOCOL_VERSION);
    assert_eq!(packed[1], 7);
    assert_eq!(&packed[2..4], &[0, 0]);
    assert_eq!(&packed[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(&packed[12..16], &[0x0A, 0x0B, 0x0C, 0x0D]);
}

#[test]
fn test_opcode_values_are_stable() {
    let expected = [
        (OpCode::Init, 1),
        (OpCode::GetDeviceList, 2),
        (OpCode::Scan, 3),
        (OpCode::Cancel, 4),
        (OpCode::PageStart, 5),
        (OpCode::Progress, 6),
        (OpCode::Page, 7),
        (OpCode::Device, 8),
        (OpCode::Done, 9),
        (OpCode::Err, 10),
        (OpCode::Ack, 11),
    ];
    for (opcode, value) in expected {
        assert_eq!(opcode.as_u8(), value);
        assert_eq!(OpCode::from_u8(value).unwrap(), opcode);
    }
}

#[test]
fn test_scan_request_payload_format() {
    let options = ScanOptions::for_driver(Driver::Sim)
        .with_device(ScanDevice::new(Driver::Sim, "sim:flatbed?pages=2", "Flatbed"));
    let msg = Message::json(OpCode::Scan, 9, &options).unwrap();

    let value: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(value["driver"], "sim");
    assert_eq!(value["device"]["id"], "sim:flatbed?pages=2");
    assert_eq!(value["bit_depth"], "color");
    assert_eq!(value["driver_arch"], "native");
}

#[test]
fn test_error_payload_format() {
    let payload = ErrorPayload {
        kind: FaultKind::DeviceOffline,
        message: "paper jam".to_string(),
    };
    let msg = Message::json(OpCode::Err, 1, &payload).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(value["kind"], "device_offline");
    assert_eq!(value["message"], "paper jam");
}
