//! Commands submitted before the connection is ready are queued and then
//! replayed, in order, once the ready check passes.

mod support;

use respire::{Client, ClientConfig, Value};
use std::time::Duration;
use support::ScriptedServer;

#[tokio::test]
async fn offline_commands_are_queued_and_replayed_in_order() {
    let server = ScriptedServer::start().await;
    let config = ClientConfig {
        port: server.port(),
        ..ClientConfig::default()
    };
    let client = Client::connect_tcp("127.0.0.1", server.port(), config);

    // Submitted while the ready check is still gated off, so both land in
    // the offline queue rather than racing the ready check. Spawned rather
    // than just bound to a variable — an unpolled `async fn` call performs
    // no side effects, so without `tokio::spawn` neither command would
    // actually be dispatched until it was awaited, which happens below
    // `wait_for_tail` and would make it hang.
    let set_task = tokio::spawn({
        let client = client.clone();
        async move { client.command("SET", &["foo", "bar"]).await }
    });
    let get_task = tokio::spawn({
        let client = client.clone();
        async move { client.command::<&str>("GET", &["foo"]).await }
    });
    tokio::task::yield_now().await;

    server.release_ready();

    let expected_wire = [
        b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".as_slice(),
        b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n".as_slice(),
    ]
    .concat();
    server
        .wait_for_tail(&expected_wire, Duration::from_secs(5))
        .await;

    server.push_response(b"+OK\r\n".to_vec());
    server.push_response(b"$3\r\nbar\r\n".to_vec());

    let set_reply = set_task.await.expect("task").expect("SET reply");
    let get_reply = get_task.await.expect("task").expect("GET reply");
    assert_eq!(set_reply, Value::Okay);
    assert_eq!(get_reply, Value::BulkString(b"bar".to_vec()));
}
