mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{policy, Harness, MockDriver};
use querygate_lib::commands::{serve, serve_until};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;

async fn exchange(harness: &Harness, input: &str) -> HashMap<String, Value> {
    exchange_bytes(harness, input.as_bytes()).await
}

async fn exchange_bytes(harness: &Harness, input: &[u8]) -> HashMap<String, Value> {
    let (writer, reader) = tokio::io::duplex(64 * 1024);

    serve(harness.executor.clone(), BufReader::new(input), writer, 4)
        .await
        .unwrap();

    read_frames(reader).await
}

async fn read_frames(mut reader: DuplexStream) -> HashMap<String, Value> {
    let mut output = String::new();
    reader.read_to_string(&mut output).await.unwrap();

    output
        .lines()
        .map(|line| {
            let frame: Value = serde_json::from_str(line).unwrap();
            (frame["id"].to_string(), frame)
        })
        .collect()
}

#[tokio::test]
async fn four_tools_answer_over_json_lines() {
    let harness = Harness::new(MockDriver::with_rows(3), policy(2, Duration::from_secs(2)));
    let input = [
        json!({"id": 1, "tool": "query_database", "arguments": {"query": "SELECT n FROM users WHERE id > $1", "params": [0]}}),
        json!({"id": 2, "tool": "get_table_schema", "arguments": {"table_name": "users"}}),
        json!({"id": 3, "tool": "list_tables", "arguments": {"schema_name": "sales"}}),
        json!({"id": 4, "tool": "get_security_config"}),
    ]
    .iter()
    .map(|v| v.to_string())
    .collect::<Vec<_>>()
    .join("\n");

    let responses = exchange(&harness, &input).await;
    assert_eq!(responses.len(), 4);

    let query = &responses["1"];
    assert_eq!(query["ok"], true);
    assert_eq!(query["result"]["rowCount"], 2);
    assert_eq!(query["result"]["truncated"], true);
    assert_eq!(query["result"]["data"][1]["n"], 1);
    assert_eq!(query["result"]["restrictions"]["maxRowsLimit"], 2);

    let schema = &responses["2"];
    assert_eq!(schema["result"][1]["column_name"], "name");
    assert_eq!(schema["result"][1]["character_maximum_length"], 64);

    let tables = &responses["3"];
    assert_eq!(
        tables["result"],
        json!([{"schema_name": "sales", "table_name": "invoices"}])
    );

    let config = &responses["4"]["result"];
    assert_eq!(config["restrictions"]["maxRowsLimit"], 2);
    assert_eq!(config["restrictions"]["allowedTables"], "ALL (no restrictions)");
    assert!(!config.to_string().contains("password"));
}

#[tokio::test]
async fn errors_are_structured() {
    let harness = Harness::new(MockDriver::with_rows(1), policy(10, Duration::from_secs(2)));
    let input = [
        json!({"id": "a", "tool": "query_database", "arguments": {"query": "DELETE FROM users"}}).to_string(),
        json!({"id": "b", "tool": "drop_everything", "arguments": {}}).to_string(),
        json!({"id": "c", "tool": "query_database", "arguments": {"query": "SELECT $1", "params": [[1, 2]]}}).to_string(),
        "this is not json".to_string(),
        String::new(),
    ]
    .join("\n");

    let responses = exchange(&harness, &input).await;
    assert_eq!(responses.len(), 4);

    let rejected = &responses["\"a\""];
    assert_eq!(rejected["ok"], false);
    assert_eq!(rejected["error"]["category"], "validation");
    assert_eq!(rejected["error"]["violation"]["keyword"], "DELETE");
    assert_eq!(rejected["error"]["retryable"], false);

    assert_eq!(responses["\"b\""]["error"]["code"], "invalid_argument");
    assert_eq!(responses["\"c\""]["error"]["code"], "invalid_argument");
    assert_eq!(responses["null"]["error"]["category"], "invalid_argument");

    // only the request that reached the executor is audited
    assert_eq!(harness.audit_records().len(), 1);
    assert_eq!(harness.driver.fetches(), 0);
}

#[tokio::test]
async fn undecodable_line_does_not_stop_the_dispatcher() {
    let harness = Harness::new(MockDriver::with_rows(1), policy(10, Duration::from_millis(300)));
    let mut input = json!({"id": 1, "tool": "query_database", "arguments": {"query": "SELECT pg_sleep(10)"}})
        .to_string()
        .into_bytes();
    input.extend_from_slice(b"\n\xff\xfe\n");
    input.extend_from_slice(json!({"id": 3, "tool": "get_security_config"}).to_string().as_bytes());
    input.push(b'\n');

    let responses = exchange_bytes(&harness, &input).await;
    assert_eq!(responses.len(), 3);

    assert_eq!(responses["1"]["error"]["code"], "timeout");
    assert_eq!(responses["null"]["error"]["code"], "invalid_argument");
    assert_eq!(responses["3"]["ok"], true);

    // the slow request ran to completion and was audited
    assert_eq!(harness.driver.fetches(), 1);
    assert_eq!(harness.audit_records().len(), 1);
}

#[tokio::test]
async fn shutdown_lets_in_flight_requests_finish() {
    let harness = Harness::new(MockDriver::with_rows(1), policy(10, Duration::from_millis(300)));
    let (mut client, server_input) = tokio::io::duplex(4 * 1024);
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let (stop, stopped) = oneshot::channel::<()>();

    let request = json!({"id": 7, "tool": "query_database", "arguments": {"query": "SELECT pg_sleep(10)"}});
    client
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();

    let server = tokio::spawn(serve_until(
        harness.executor.clone(),
        BufReader::new(server_input),
        writer,
        4,
        async move {
            let _ = stopped.await;
        },
    ));

    // input stays open; only the shutdown signal ends the loop
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.send(()).unwrap();
    server.await.unwrap().unwrap();

    let responses = read_frames(reader).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses["7"]["error"]["code"], "timeout");
    assert_eq!(harness.audit_records().len(), 1);
    drop(client);
}
