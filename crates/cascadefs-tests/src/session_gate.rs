//! The session gate driven over a real socket, as a publisher would

use cascadefs_receiver::{read_reply, write_request, Command, Reactor};
use serde_json::Value;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// Serve exactly one reactor session on an ephemeral port; returns the
/// client stream and the server thread
fn serve_session() -> (TcpStream, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let input = stream.try_clone().unwrap();
        let _ = Reactor::new(input, stream).run();
    });
    let client = TcpStream::connect(addr).unwrap();
    (client, server)
}

fn request(stream: &mut TcpStream, command: Command, body: &[u8]) -> Vec<u8> {
    write_request(stream, command, body).unwrap();
    read_reply(stream).unwrap()
}

fn request_json(stream: &mut TcpStream, command: Command, body: &Value) -> Value {
    let reply = request(stream, command, body.to_string().as_bytes());
    serde_json::from_slice(&reply).unwrap()
}

#[test]
fn lease_lifecycle_over_a_socket() {
    let (mut client, server) = serve_session();

    // Obtain a lease on /a.
    let issued = request_json(
        &mut client,
        Command::GenerateToken,
        &serde_json::json!({"key_id": "k", "path": "/a", "max_lease_time": 1000}),
    );
    let token = issued["token"].as_str().unwrap().to_string();
    let secret = issued["secret"].as_str().unwrap().to_string();
    assert!(issued["id"].as_str().is_some());

    // The lease validates while fresh.
    let check = request_json(
        &mut client,
        Command::CheckToken,
        &serde_json::json!({"token": token, "secret": secret}),
    );
    assert_eq!(check["status"], "ok");
    assert_eq!(check["path"], "/a");

    // And expires strictly after its lease time.
    thread::sleep(Duration::from_millis(1100));
    let check = request_json(
        &mut client,
        Command::CheckToken,
        &serde_json::json!({"token": token, "secret": secret}),
    );
    assert_eq!(check["status"], "error");
    assert_eq!(check["reason"], "expired_token");

    let goodbye = request(&mut client, Command::Quit, b"");
    assert_eq!(goodbye, b"ok");
    server.join().unwrap();
}

#[test]
fn hangup_without_quit_is_clean() {
    let (client, server) = serve_session();
    drop(client);
    server.join().unwrap();
}

#[test]
fn echo_over_a_socket() {
    let (mut client, server) = serve_session();
    let reply = request(&mut client, Command::Echo, b"ping");
    assert_eq!(reply, b"ping");
    let goodbye = request(&mut client, Command::Quit, b"");
    assert_eq!(goodbye, b"ok");
    server.join().unwrap();
}
