//! Connections over an in-memory non-blocking pipe
//!
//! The pipe moves a few bytes per call and reports `WouldBlock` when empty,
//! so every handshake step and record has to survive partial I/O.

mod common;

use common::*;
use jimmies::alert::AlertDescription;
use jimmies::handshake::HandshakeState;
use jimmies::{Connection, ConnectionState, Error, ErrorKind, Role, Transport};

fn pair(pki: &Pki, chunk: usize) -> (Connection<MemoryStream>, Connection<MemoryStream>) {
    let (a, b) = memory_pair(chunk);
    let client = client_context(pki).wrap(a, Role::Client, Some(HOSTNAME)).unwrap();
    let server = server_context(pki).wrap(b, Role::Server, None).unwrap();
    (client, server)
}

/// Move `data` from `from` to `to`, pumping both sides
fn transfer(
    from: &mut Connection<MemoryStream>,
    to: &mut Connection<MemoryStream>,
    data: &[u8],
) -> Vec<u8> {
    assert_eq!(from.send(data).unwrap(), data.len());
    let mut received = Vec::new();
    for _ in 0..1_000_000 {
        if received.len() == data.len() {
            break;
        }
        match from.flush() {
            Ok(()) | Err(Error::WouldBlock) => {}
            Err(e) => panic!("flush failed: {}", e),
        }
        match to.receive(4096) {
            Ok(chunk) => received.extend_from_slice(&chunk),
            Err(Error::WouldBlock) => {}
            Err(e) => panic!("receive failed: {}", e),
        }
    }
    received
}

#[test]
fn test_would_block_handshake() {
    init_logging();
    let pki = Pki::new();
    let (mut client, mut server) = pair(&pki, 7);

    assert!(matches!(client.handshake(), Err(Error::WouldBlock)));
    assert_eq!(client.state(), ConnectionState::Handshaking);
    assert!(matches!(server.handshake(), Err(Error::WouldBlock)));

    let (c, s) = drive_handshakes(&mut client, &mut server);
    c.unwrap();
    s.unwrap();
    assert_eq!(client.version(), Some("TLSv1.3"));
    assert_eq!(server.version(), Some("TLSv1.3"));
    assert_eq!(client.cipher(), server.cipher());

    let received = transfer(&mut client, &mut server, b"whose woods these are, I think I know");
    assert_eq!(received, b"whose woods these are, I think I know");
    let received = transfer(&mut server, &mut client, b"his house is in the village though");
    assert_eq!(received, b"his house is in the village though");
}

#[test]
fn test_one_byte_pipe() {
    init_logging();
    let pki = Pki::new();
    let (mut client, mut server) = pair(&pki, 1);
    let (c, s) = drive_handshakes(&mut client, &mut server);
    c.unwrap();
    s.unwrap();
    let data = vec![0x5a; 40_000];
    assert_eq!(transfer(&mut client, &mut server, &data), data);
}

#[test]
fn test_receive_before_handshake() {
    init_logging();
    let pki = Pki::new();
    let (mut client, _server) = pair(&pki, 1024);
    let err = client.receive(10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(client.state(), ConnectionState::Uninitialized);
}

#[test]
fn test_close_notify_then_eof() {
    init_logging();
    let pki = Pki::new();
    let (mut client, mut server) = pair(&pki, 1024);
    let (c, s) = drive_handshakes(&mut client, &mut server);
    c.unwrap();
    s.unwrap();

    client.shutdown().unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(server.receive(100).unwrap().is_empty());
    assert!(server.peer_closed());
    // Still empty on later reads
    assert!(server.receive(100).unwrap().is_empty());
}

#[test]
fn test_eof_without_close_notify() {
    init_logging();
    let pki = Pki::new();
    let (mut client, mut server) = pair(&pki, 1024);
    let (c, s) = drive_handshakes(&mut client, &mut server);
    c.unwrap();
    s.unwrap();

    // Close the transport underneath the connection
    Transport::close(client.get_mut()).unwrap();
    let err = server.receive(100).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(server.state(), ConnectionState::Failed);
    assert_eq!(server.receive(100).unwrap_err().kind(), ErrorKind::Connection);
}

#[test]
fn test_tampered_record() {
    init_logging();
    let pki = Pki::new();
    let (mut client, mut server) = pair(&pki, usize::MAX);
    let (c, s) = drive_handshakes(&mut client, &mut server);
    c.unwrap();
    s.unwrap();

    // Flip a ciphertext byte past the record header
    client.get_ref().corrupt_next_write(8);
    client.send(b"attack at dawn").unwrap();
    let err = server.receive(100).unwrap_err();
    assert!(matches!(err, Error::BadRecordMac), "{:?}", err);
    assert_eq!(server.state(), ConnectionState::Failed);

    // The server told the client why
    let err = client.receive(100).unwrap_err();
    assert!(
        matches!(err, Error::Alert(AlertDescription::BadRecordMac)),
        "{:?}",
        err
    );
}

#[test]
fn test_handshake_failure_alert_reaches_client() {
    init_logging();
    let pki = Pki::new();
    let stranger = Pki::new();
    let (a, b) = memory_pair(usize::MAX);
    let mut client = client_context(&stranger)
        .wrap(a, Role::Client, Some(HOSTNAME))
        .unwrap();
    let mut server = server_context(&pki).wrap(b, Role::Server, None).unwrap();

    let (c, s) = drive_handshakes(&mut client, &mut server);
    let client_err = c.unwrap_err();
    assert_eq!(client_err.kind(), ErrorKind::Tls);
    assert!(matches!(s, Err(Error::Alert(AlertDescription::UnknownCa))));

    // Terminal failures are raised again
    assert_eq!(client.handshake().unwrap_err().kind(), ErrorKind::Tls);
    assert_eq!(client.state(), ConnectionState::Failed);
}

#[test]
fn test_unprotected_alerts_after_handshake() {
    init_logging();
    let pki = Pki::new();
    // A forged close_notify, then a forged fatal handshake_failure
    for forged in [[21u8, 3, 3, 0, 2, 1, 0], [21u8, 3, 3, 0, 2, 2, 40]] {
        let (mut client, mut server) = pair(&pki, usize::MAX);
        let (c, s) = drive_handshakes(&mut client, &mut server);
        c.unwrap();
        s.unwrap();
        assert_eq!(client.handshake_state(), HandshakeState::Finished);

        // Written straight to the wire, bypassing the server's record layer
        Transport::write(server.get_mut(), &forged).unwrap();
        let err = client.receive(1024).unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)), "{:?}", err);
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!client.peer_closed());
        assert_eq!(client.state(), ConnectionState::Failed);
    }
}
