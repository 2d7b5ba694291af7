//! Socket-level server tests
//!
//! Exercise the full path - TCP bytes through the connection pump,
//! dispatcher, channel bridge, a scripted device thread, and the completion
//! router back to TCP - with the literal byte sequences the Linux usbip
//! client sends.

use std::sync::Arc;

use common::{create_usb_bridge, HostCommand, TransferDone, TransferStatus};
use protocol::{
    DeviceRecord, DeviceSpeed, EndpointMap, EndpointRecord, InterfaceRecord, DEVICE_BLOCK_SIZE,
};
use server::engine::{router::run_completion_router, Engine};
use server::network::ClientConnection;
use server::usb::BridgeHost;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0x01,
    0x02, 0x03, 0x01,
];

fn exported_device() -> DeviceRecord {
    let mut endpoints = EndpointMap::new();
    endpoints.insert(EndpointRecord {
        address: 0x81,
        max_packet_size: 64,
        attributes: 0x02,
    });
    endpoints.insert(EndpointRecord {
        address: 0x01,
        max_packet_size: 64,
        attributes: 0x02,
    });

    DeviceRecord {
        path: "/sys/devices/platform/usbip-host/1-1".to_string(),
        busid: "1-1".to_string(),
        busnum: 1,
        devnum: 1,
        speed: DeviceSpeed::Full,
        vendor_id: 0x1234,
        product_id: 0x5678,
        bcd_device: 0x0100,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        interfaces: vec![InterfaceRecord {
            class: 0x03,
            subclass: 0x00,
            protocol: 0x00,
        }],
        endpoints,
    }
}

/// Stand-in for the USB worker thread: answers control IN transfers with a
/// fixed device descriptor and acknowledges everything else.
fn spawn_scripted_device(worker: common::UsbWorker) {
    std::thread::spawn(move || {
        while let Ok(cmd) = worker.recv_command() {
            match cmd {
                HostCommand::SubmitControl(mut transfer) => {
                    transfer.buffer[8..8 + DEVICE_DESCRIPTOR.len()]
                        .copy_from_slice(&DEVICE_DESCRIPTOR);
                    let done = TransferDone {
                        token: transfer.token,
                        status: TransferStatus::Completed,
                        actual: 8 + DEVICE_DESCRIPTOR.len(),
                        buffer: transfer.buffer,
                    };
                    worker.post_completion(done).unwrap();
                }
                HostCommand::Submit(transfer) => {
                    let actual = if transfer.endpoint & 0x80 == 0 {
                        transfer.buffer.len()
                    } else {
                        0
                    };
                    let done = TransferDone {
                        token: transfer.token,
                        status: TransferStatus::Completed,
                        actual,
                        buffer: transfer.buffer,
                    };
                    worker.post_completion(done).unwrap();
                }
                HostCommand::Cancel { .. } => {}
                HostCommand::Shutdown => break,
            }
        }
    });
}

async fn start_server() -> TcpStream {
    let (bridge, worker) = create_usb_bridge();
    spawn_scripted_device(worker);

    let host = Arc::new(BridgeHost::new(bridge.clone()));
    let engine = Arc::new(Engine::new(host, 32));
    engine.registry().publish(exported_device());
    tokio::spawn(run_completion_router(engine.clone(), bridge));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let _ = ClientConnection::new(engine, peer).run(stream).await;
    });

    TcpStream::connect(addr).await.unwrap()
}

fn import_request() -> Vec<u8> {
    let mut request = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
    let mut busid = [0u8; 32];
    busid[..3].copy_from_slice(b"1-1");
    request.extend_from_slice(&busid);
    request
}

fn get_descriptor_submit(seqnum: u32) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(48);
    pdu.extend_from_slice(&1u32.to_be_bytes()); // CMD_SUBMIT
    pdu.extend_from_slice(&seqnum.to_be_bytes());
    pdu.extend_from_slice(&0x0001_0001u32.to_be_bytes()); // devid
    pdu.extend_from_slice(&1u32.to_be_bytes()); // direction IN
    pdu.extend_from_slice(&0u32.to_be_bytes()); // ep 0
    pdu.extend_from_slice(&0u32.to_be_bytes()); // transfer_flags
    pdu.extend_from_slice(&18u32.to_be_bytes()); // transfer_buffer_length
    pdu.extend_from_slice(&[0u8; 12]); // start_frame, packets, interval
    pdu.extend_from_slice(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    pdu
}

#[tokio::test]
async fn devlist_over_tcp() {
    let mut client = start_server().await;

    client
        .write_all(&[0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00])
        .await
        .unwrap();

    let mut reply = vec![0u8; 328];
    client.read_exact(&mut reply).await.unwrap();

    assert_eq!(&reply[0..4], &[0x01, 0x11, 0x00, 0x05]);
    assert_eq!(&reply[8..12], &[0, 0, 0, 1]); // one exported device
    let block = &reply[12..12 + DEVICE_BLOCK_SIZE];
    assert_eq!(&block[300..302], &[0x12, 0x34]); // idVendor
}

#[tokio::test]
async fn import_then_control_transfer_over_tcp() {
    let mut client = start_server().await;

    client.write_all(&import_request()).await.unwrap();
    let mut reply = vec![0u8; 8 + DEVICE_BLOCK_SIZE];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[0..8], &[0x01, 0x11, 0x00, 0x03, 0, 0, 0, 0]);

    // GET_DESCRIPTOR on the imported device
    client
        .write_all(&get_descriptor_submit(0x100))
        .await
        .unwrap();

    let mut response = vec![0u8; 66];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response[0..4], &[0, 0, 0, 3]); // RET_SUBMIT
    assert_eq!(&response[4..8], &[0, 0, 1, 0]); // seqnum 0x100
    assert_eq!(&response[20..24], &[0, 0, 0, 0]); // status 0
    assert_eq!(&response[24..28], &[0, 0, 0, 0x12]); // actual_length 18
    assert_eq!(&response[48..], &DEVICE_DESCRIPTOR);
}

#[tokio::test]
async fn import_of_unknown_busid_fails() {
    let mut client = start_server().await;

    let mut request = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
    let mut busid = [0u8; 32];
    busid[..3].copy_from_slice(b"9-9");
    request.extend_from_slice(&busid);
    client.write_all(&request).await.unwrap();

    let mut reply = vec![0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x11, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
}

#[tokio::test]
async fn bulk_out_round_trip_over_tcp() {
    let mut client = start_server().await;

    client.write_all(&import_request()).await.unwrap();
    let mut reply = vec![0u8; 8 + DEVICE_BLOCK_SIZE];
    client.read_exact(&mut reply).await.unwrap();

    // 64-byte bulk OUT on endpoint 1, split across two writes to exercise
    // the accumulation buffer
    let mut pdu = Vec::with_capacity(48 + 64);
    pdu.extend_from_slice(&1u32.to_be_bytes());
    pdu.extend_from_slice(&0x200u32.to_be_bytes());
    pdu.extend_from_slice(&0x0001_0001u32.to_be_bytes());
    pdu.extend_from_slice(&0u32.to_be_bytes()); // direction OUT
    pdu.extend_from_slice(&1u32.to_be_bytes()); // ep 1
    pdu.extend_from_slice(&0u32.to_be_bytes());
    pdu.extend_from_slice(&64u32.to_be_bytes());
    pdu.extend_from_slice(&[0u8; 20]); // start_frame..setup
    pdu.extend_from_slice(&[0x5a; 64]);

    client.write_all(&pdu[..50]).await.unwrap();
    client.flush().await.unwrap();
    client.write_all(&pdu[50..]).await.unwrap();

    let mut response = vec![0u8; 48];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response[0..4], &[0, 0, 0, 3]);
    assert_eq!(&response[4..8], &[0, 0, 0x02, 0]); // seqnum 0x200
    assert_eq!(&response[20..24], &[0, 0, 0, 0]); // status
    assert_eq!(&response[24..28], &[0, 0, 0, 0]); // no payload for OUT
}
