//! End-to-end tests: two message layers exchanging traffic over loopback.

use hearth_core::message::EncryptionType;
use hearth_core::{
    Config, ConnectionState, MessageFlags, MessageInfo, MessageLayer, PayloadBuf,
};
use hearth_integration_tests::{
    settle, tcp_addr, test_layer, udp_addr, SharedKeyDirectory, TEST_KEY_ID,
};
use hearth_transport::TcpChannel;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

const NODE_A: u64 = 0xA;
const NODE_B: u64 = 0xB;

type Received = Rc<RefCell<Vec<(MessageInfo, Vec<u8>)>>>;

fn capture(layer: &mut MessageLayer) -> Received {
    let received: Received = Rc::default();
    let sink = Rc::clone(&received);
    layer.set_on_message_received(Some(Box::new(move |info, payload| {
        sink.borrow_mut().push((info, payload.as_slice().to_vec()));
    })));
    received
}

#[test]
fn plain_message_between_two_layers() {
    let mut a = test_layer(NODE_A);
    let mut b = test_layer(NODE_B);
    let received = capture(&mut b);

    let mut info = MessageInfo::default();
    a.send_message(
        Some(udp_addr(&b)),
        None,
        &mut info,
        PayloadBuf::for_message(b"hello from a"),
    )
    .unwrap();

    settle(&mut b);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, b"hello from a");
    assert_eq!(got[0].0.message_id, info.message_id);

    drop(got);
    a.shutdown();
    b.shutdown();
}

#[test]
fn encrypted_message_between_two_layers() {
    let mut a = test_layer(NODE_A);
    let mut b = test_layer(NODE_B);
    let received = capture(&mut b);

    let mut info = MessageInfo {
        flags: MessageFlags::new()
            .with(MessageFlags::HAS_SOURCE_NODE_ID)
            .with(MessageFlags::HAS_DEST_NODE_ID),
        encryption_type: EncryptionType::Aes128CtrHmacSha1,
        dest_node_id: NODE_B,
        key_id: TEST_KEY_ID,
        ..MessageInfo::default()
    };
    a.send_message(
        Some(udp_addr(&b)),
        None,
        &mut info,
        PayloadBuf::for_message(b"set thermostat 19C"),
    )
    .unwrap();

    settle(&mut b);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, b"set thermostat 19C");
    assert_eq!(got[0].0.source_node_id, NODE_A);
    assert_eq!(got[0].0.dest_node_id, NODE_B);

    drop(got);
    a.shutdown();
    b.shutdown();
}

#[test]
fn destination_resolution_through_directory() {
    let mut b = test_layer(NODE_B);
    let b_addr = udp_addr(&b);
    let received = capture(&mut b);

    let mut directory = SharedKeyDirectory::new();
    directory.add_peer(NODE_B, b_addr);
    let mut a = MessageLayer::new(
        Config {
            port: 0,
            listen_ipv6: false,
            local_node_id: NODE_A,
            ..Config::default()
        },
        Box::new(directory),
    );
    a.refresh_endpoints().unwrap();

    // No explicit destination address: the fabric directory resolves it.
    let mut info = MessageInfo {
        flags: MessageFlags::new().with(MessageFlags::HAS_DEST_NODE_ID),
        dest_node_id: NODE_B,
        ..MessageInfo::default()
    };
    a.send_message(None, None, &mut info, PayloadBuf::for_message(b"resolved"))
        .unwrap();

    settle(&mut b);
    assert_eq!(received.borrow().len(), 1);

    a.shutdown();
    b.shutdown();
}

#[test]
fn message_over_tcp_connection() {
    let mut a = test_layer(NODE_A);
    let mut b = test_layer(NODE_B);
    let received = capture(&mut b);

    let accepted: Rc<RefCell<Vec<hearth_core::ConnectionHandle>>> = Rc::default();
    let sink = Rc::clone(&accepted);
    b.set_on_connection_received(Some(Box::new(move |handle| {
        sink.borrow_mut().push(handle);
    })));

    let handle = a.connect(tcp_addr(&b), NODE_B).unwrap();

    // Let the handshake finish on both sides.
    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(5));
        a.poll();
        b.poll();
        let connected = a
            .connections()
            .get(handle)
            .is_some_and(|c| c.state == ConnectionState::Connected);
        if connected && !accepted.borrow().is_empty() {
            break;
        }
    }
    assert_eq!(accepted.borrow().len(), 1);

    let mut info = MessageInfo::default();
    a.send_message_over_connection(handle, &mut info, PayloadBuf::for_message(b"stream me"))
        .unwrap();

    settle(&mut b);

    let got = received.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, b"stream me");

    drop(got);
    a.shutdown();
    b.shutdown();
}

#[test]
fn tunnel_relays_between_two_clients() {
    let mut b = test_layer(NODE_B);

    let accepted: Rc<RefCell<Vec<hearth_core::ConnectionHandle>>> = Rc::default();
    let sink = Rc::clone(&accepted);
    b.set_on_connection_received(Some(Box::new(move |handle| {
        sink.borrow_mut().push(handle);
    })));

    let mut c1 = TcpChannel::connect(tcp_addr(&b)).unwrap();
    let mut c2 = TcpChannel::connect(tcp_addr(&b)).unwrap();

    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(5));
        b.poll();
        if accepted.borrow().len() == 2 {
            break;
        }
    }
    let handles = accepted.borrow().clone();
    assert_eq!(handles.len(), 2);

    b.create_tunnel(handles[0], handles[1], Some(Duration::from_secs(10)))
        .unwrap();
    // coupling closed the source connection objects without freeing them
    assert_eq!(
        b.connections().get(handles[0]).unwrap().state,
        ConnectionState::Closed
    );

    c1.send_framed(b"through the relay").unwrap();

    let mut got = None;
    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(5));
        b.poll();
        if let Ok(Some(msg)) = c2.poll_message() {
            got = Some(msg);
            break;
        }
    }
    assert_eq!(got.unwrap(), b"through the relay");

    b.shutdown();
}

#[test]
fn inbound_connections_respect_pool_capacity() {
    let mut b = test_layer(NODE_B);

    let accept_errors: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = Rc::clone(&accept_errors);
    b.set_on_accept_error(Some(Box::new(move |e| {
        sink.borrow_mut().push(e.to_string());
    })));
    let accepted: Rc<RefCell<Vec<hearth_core::ConnectionHandle>>> = Rc::default();
    let sink = Rc::clone(&accepted);
    b.set_on_connection_received(Some(Box::new(move |handle| {
        sink.borrow_mut().push(handle);
    })));

    let capacity = hearth_core::pool::CONNECTION_POOL_SIZE;
    let mut clients = Vec::new();
    for _ in 0..capacity {
        clients.push(TcpChannel::connect(tcp_addr(&b)).unwrap());
        settle(&mut b);
    }
    assert_eq!(accepted.borrow().len(), capacity);

    // One more: accepted by the OS, refused by the pool.
    clients.push(TcpChannel::connect(tcp_addr(&b)).unwrap());
    settle(&mut b);
    assert!(accept_errors
        .borrow()
        .iter()
        .any(|e| e.contains("exhausted")));

    // Releasing one slot lets the next connection in.
    let freed = accepted.borrow()[0];
    b.connections_mut().release(freed);
    clients.push(TcpChannel::connect(tcp_addr(&b)).unwrap());
    settle(&mut b);
    assert_eq!(accepted.borrow().len(), capacity + 1);

    b.shutdown();
}

#[test]
fn shutdown_then_refresh_restores_service() {
    let mut a = test_layer(NODE_A);
    let mut b = test_layer(NODE_B);
    let received = capture(&mut b);

    b.shutdown();
    assert!(b.udp_local_addr(true).is_none());

    b.refresh_endpoints().unwrap();
    let mut info = MessageInfo::default();
    a.send_message(
        Some(udp_addr(&b)),
        None,
        &mut info,
        PayloadBuf::for_message(b"back online"),
    )
    .unwrap();

    settle(&mut b);
    assert_eq!(received.borrow().len(), 1);

    a.shutdown();
    b.shutdown();
}
