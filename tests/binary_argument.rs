//! A binary argument is written as header, raw payload, and trailing CRLF
//! — never copied through the text fast path, and never escaped.

mod support;

use respire::{Arg, Client, ClientConfig, Value};
use std::time::Duration;
use support::ScriptedServer;

#[tokio::test]
async fn binary_value_is_written_as_three_part_frame() {
    let server = ScriptedServer::start().await;
    server.release_ready();

    let config = ClientConfig {
        port: server.port(),
        ..ClientConfig::default()
    };
    let client = Client::connect_tcp("127.0.0.1", server.port(), config);

    let mut events = client.events();
    loop {
        match events.recv().await.expect("event stream") {
            respire::Event::Ready => break,
            _ => continue,
        }
    }

    // 32 KiB of non-text-safe bytes, including NUL and bare CR/LF, to prove
    // the payload is never scanned or escaped on its way to the wire.
    let payload: Vec<u8> = (0..32 * 1024)
        .map(|i| match i % 37 {
            0 => 0x00,
            1 => b'\r',
            2 => b'\n',
            _ => (i % 256) as u8,
        })
        .collect();

    let mut expected = Vec::new();
    expected.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n");
    expected.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
    expected.extend_from_slice(&payload);
    expected.extend_from_slice(b"\r\n");

    let send_task = tokio::spawn(async move {
        client
            .send(
                "SET",
                vec![Arg::Text("bin".to_string()), Arg::Binary(payload)],
            )
            .await
    });

    server.wait_for_tail(&expected, Duration::from_secs(5)).await;
    server.push_response(b"+OK\r\n".to_vec());

    let reply = send_task.await.expect("send task").expect("reply");
    assert_eq!(reply, Value::Okay);
}
