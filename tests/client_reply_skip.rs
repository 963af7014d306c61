//! `CLIENT REPLY SKIP` suppresses the reply for exactly the next command,
//! which resolves locally with `Nil` rather than waiting on the wire
//! (spec §4.7, §8 scenario 6; see Design Note 6 in `DESIGN.md`).

mod support;

use respire::{Client, ClientConfig, ClientReplyMode, Event, Value};
use std::time::Duration;
use support::ScriptedServer;

#[tokio::test]
async fn skip_suppresses_exactly_one_reply() {
    let server = ScriptedServer::start().await;
    server.release_ready();

    let config = ClientConfig {
        port: server.port(),
        ..ClientConfig::default()
    };
    let client = Client::connect_tcp("127.0.0.1", server.port(), config);

    let mut events = client.events();
    wait_for_ready(&mut events).await;

    client
        .client_reply(ClientReplyMode::Skip)
        .await
        .expect("CLIENT REPLY SKIP dispatch");

    // Neither `CLIENT REPLY SKIP` nor `SET a 1` gets a reply from the
    // server, so both resolve without the server ever writing back.
    let set_reply = client
        .command("SET", &["a", "1"])
        .await
        .expect("SET resolves locally");
    assert_eq!(set_reply, Value::Nil);

    let get_task = tokio::spawn({
        let client = client.clone();
        async move { client.command::<&str>("GET", &["a"]).await }
    });

    let expected_wire = [
        b"*3\r\n$6\r\nCLIENT\r\n$5\r\nREPLY\r\n$4\r\nSKIP\r\n".as_slice(),
        b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n".as_slice(),
        b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n".as_slice(),
    ]
    .concat();
    server
        .wait_for_tail(&expected_wire, Duration::from_secs(5))
        .await;

    // Only the `GET` occupies an in-flight slot: the suppressed SKIP and
    // SET already resolved without waiting on anything from the wire.
    let in_flight = client
        .command_queue_length()
        .await
        .expect("queue length accessor");
    assert_eq!(in_flight, 1);

    server.push_response(b"$1\r\n1\r\n".to_vec());
    let get_reply = get_task.await.expect("task").expect("GET reply");
    assert_eq!(get_reply, Value::BulkString(b"1".to_vec()));

    // `reply_mode` reverted to `On` after the one suppressed command, so a
    // further `CLIENT REPLY ON` gets a real in-flight slot waiting on `+OK`.
    let reply_on_task = tokio::spawn({
        let client = client.clone();
        async move { client.client_reply(ClientReplyMode::On).await }
    });
    server
        .wait_for_tail(
            b"*3\r\n$6\r\nCLIENT\r\n$5\r\nREPLY\r\n$2\r\nON\r\n",
            Duration::from_secs(5),
        )
        .await;
    reply_on_task
        .await
        .expect("task")
        .expect("CLIENT REPLY ON dispatch");
}

async fn wait_for_ready(events: &mut tokio::sync::broadcast::Receiver<Event>) {
    loop {
        match events.recv().await.expect("event stream") {
            Event::Ready => return,
            _ => continue,
        }
    }
}
