//! Shared scaffolding for the scenario tests.
//!
//! Connections are exercised over loopback TCP pairs: real blocking
//! sockets, real kernel buffering, no in-process shortcuts. `raw_pair`
//! hands back one side as a bare stream for tests that speak the wire
//! protocol directly.

#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};

use crosswire::{Connection, ConnectionConfig};

/// Two connected engine endpoints over loopback TCP
pub fn tcp_pair(left: ConnectionConfig, right: ConnectionConfig) -> (Connection, Connection) {
    let (connector, accepted) = stream_pair();
    (
        Connection::over_tcp(connector, left).unwrap(),
        Connection::over_tcp(accepted, right).unwrap(),
    )
}

/// One engine endpoint plus the peer's raw stream, for protocol-level tests
pub fn raw_pair(config: ConnectionConfig) -> (TcpStream, Connection) {
    let (connector, accepted) = stream_pair();
    (connector, Connection::over_tcp(accepted, config).unwrap())
}

fn stream_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let connector = TcpStream::connect(addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    (connector, accepted)
}
