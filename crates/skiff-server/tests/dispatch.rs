//! Engine-level tests driving a server over a direct channel pair with raw
//! frames, so the exact bytes on the wire can be asserted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use skiff_jsonrpc::channel::{direct, Channel, Direct};
use skiff_jsonrpc::error::ErrorObject;
use skiff_server::{handler, MethodMap, Server, ServerOptions};

const SHORT: Duration = Duration::from_millis(100);
const LONG: Duration = Duration::from_secs(5);

fn test_assigner() -> MethodMap {
    MethodMap::new()
        .insert(
            "Add",
            handler::variadic(|_ctx, xs: Vec<i64>| async move { Ok(xs.iter().sum::<i64>()) }),
        )
        .insert("X", handler::nullary(|_ctx| async move { Ok("a") }))
        .insert(
            "Y",
            handler::typed(|_ctx, _args: Option<Vec<Value>>| async move { Ok("b") }),
        )
        .insert("N", handler::nullary(|_ctx| async move { Ok(()) }))
}

fn start(assigner: MethodMap, options: ServerOptions) -> (Server, Direct) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (local, remote) = direct();
    (Server::start(local, assigner, options), remote)
}

async fn roundtrip(remote: &Direct, frame: &str) -> Value {
    remote.send(frame.as_bytes()).await.unwrap();
    let reply = timeout(LONG, remote.recv()).await.unwrap().unwrap().unwrap();
    serde_json::from_slice(&reply).unwrap()
}

#[tokio::test]
async fn test_simple_call() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":1,"method":"Add","params":[2,3]}"#).await;
    assert_eq!(rsp, json!({"jsonrpc":"2.0","id":1,"result":5}));
}

#[tokio::test]
async fn test_notification_produces_no_bytes() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    remote
        .send(br#"{"jsonrpc":"2.0","method":"N","params":null}"#)
        .await
        .unwrap();
    assert!(timeout(SHORT, remote.recv()).await.is_err());
}

#[tokio::test]
async fn test_all_notification_batch_is_silent() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    remote
        .send(br#"[{"jsonrpc":"2.0","method":"N"},{"jsonrpc":"2.0","method":"N"}]"#)
        .await
        .unwrap();
    assert!(timeout(SHORT, remote.recv()).await.is_err());
}

#[tokio::test]
async fn test_mixed_batch_preserves_positions() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(
        &remote,
        r#"[{"jsonrpc":"2.0","id":1,"method":"X"},{"jsonrpc":"2.0","method":"N"},{"jsonrpc":"2.0","id":2,"method":"Y","params":[]}]"#,
    )
    .await;
    assert_eq!(
        rsp,
        json!([
            {"jsonrpc":"2.0","id":1,"result":"a"},
            {"jsonrpc":"2.0","id":2,"result":"b"}
        ])
    );
}

#[tokio::test]
async fn test_batch_correlation_is_a_permutation() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let batch: Vec<Value> = (0..10)
        .map(|i| json!({"jsonrpc":"2.0","id":i,"method":"Add","params":[i]}))
        .collect();
    let rsp = roundtrip(&remote, &serde_json::to_string(&batch).unwrap()).await;
    let entries = rsp.as_array().unwrap();
    assert_eq!(entries.len(), 10);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry["id"], json!(i));
        assert_eq!(entry["result"], json!(i));
    }
}

#[tokio::test]
async fn test_unknown_method() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":7,"method":"Missing"}"#).await;
    assert_eq!(
        rsp,
        json!({
            "jsonrpc":"2.0","id":7,
            "error":{"code":-32601,"message":"method not found: Missing"}
        })
    );
}

#[tokio::test]
async fn test_id_form_is_echoed() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":"7","method":"X"}"#).await;
    assert_eq!(rsp["id"], json!("7"));
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":7,"method":"X"}"#).await;
    assert_eq!(rsp["id"], json!(7));
}

#[tokio::test]
async fn test_single_element_batch_mirrors_shape() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(&remote, r#"[{"jsonrpc":"2.0","id":1,"method":"X"}]"#).await;
    assert!(rsp.is_array(), "array in, array out: {}", rsp);
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":1,"method":"X"}"#).await;
    assert!(rsp.is_object(), "object in, object out: {}", rsp);
}

#[tokio::test]
async fn test_empty_batch_is_invalid_request() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(&remote, "[]").await;
    assert_eq!(rsp[0]["error"]["code"], json!(-32600));
    assert_eq!(rsp[0]["id"], Value::Null);
}

#[tokio::test]
async fn test_parse_error_has_null_id() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(&remote, "{this is not json").await;
    assert_eq!(rsp["error"]["code"], json!(-32700));
    assert_eq!(rsp["id"], Value::Null);
}

#[tokio::test]
async fn test_bad_batch_element_answered_individually() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(
        &remote,
        r#"[{"jsonrpc":"2.0","id":1,"method":"X"},42,{"jsonrpc":"2.0","id":2,"method":"NoSuch"}]"#,
    )
    .await;
    let entries = rsp.as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["result"], json!("a"));
    assert_eq!(entries[1]["error"]["code"], json!(-32700));
    assert_eq!(entries[2]["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn test_duplicate_id_in_batch() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(
        &remote,
        r#"[{"jsonrpc":"2.0","id":7,"method":"X"},{"jsonrpc":"2.0","id":7,"method":"Y","params":[]}]"#,
    )
    .await;
    let entries = rsp.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["result"], json!("a"));
    assert_eq!(entries[1]["id"], json!(7));
    assert_eq!(entries[1]["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_invalid_params_arity() {
    let assigner = MethodMap::new().insert(
        "Three",
        handler::with_request(|_ctx, req| async move {
            let (x, y, s): (i64, i64, String) = skiff_server::params::positional(&req)?;
            Ok(format!("{}{}{}", x, y, s))
        }),
    );
    let (_server, remote) = start(assigner, ServerOptions::new());
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":1,"method":"Three","params":[1,2]}"#).await;
    assert_eq!(rsp["error"]["code"], json!(-32602));
    let message = rsp["error"]["message"].as_str().unwrap();
    assert!(message.contains("3"), "arity missing from: {}", message);
}

#[tokio::test]
async fn test_cancel_in_flight_request() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let assigner = MethodMap::new().insert(
        "Hang",
        handler::from_fn(move |ctx, _req| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                ctx.cancelled().await;
                Err(ErrorObject::cancelled("request cancelled"))
            }
        }),
    );
    let (_server, remote) = start(assigner, ServerOptions::new());

    remote
        .send(br#"{"jsonrpc":"2.0","id":42,"method":"Hang"}"#)
        .await
        .unwrap();
    timeout(LONG, started_rx.recv()).await.unwrap().unwrap();

    remote
        .send(br#"{"jsonrpc":"2.0","method":"rpc.cancel","params":[42]}"#)
        .await
        .unwrap();
    let reply = timeout(LONG, remote.recv()).await.unwrap().unwrap().unwrap();
    let rsp: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(rsp["id"], json!(42));
    assert_eq!(rsp["error"]["code"], json!(-32097));
}

#[tokio::test]
async fn test_cancel_unknown_id_is_a_noop() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    remote
        .send(br#"{"jsonrpc":"2.0","method":"rpc.cancel","params":[999]}"#)
        .await
        .unwrap();
    remote
        .send(br#"{"jsonrpc":"2.0","method":"rpc.cancel","params":[999]}"#)
        .await
        .unwrap();
    // The server keeps serving afterwards.
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":1,"method":"X"}"#).await;
    assert_eq!(rsp["result"], json!("a"));
}

#[tokio::test]
async fn test_concurrency_cap_respected() {
    const CAP: usize = 2;
    const TOTAL: usize = 6;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let assigner = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        MethodMap::new().insert(
            "Slow",
            handler::nullary(move |_ctx| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(true)
                }
            }),
        )
    };
    let (_server, remote) = start(assigner, ServerOptions::new().concurrency(CAP));
    let batch: Vec<Value> = (0..TOTAL)
        .map(|i| json!({"jsonrpc":"2.0","id":i,"method":"Slow"}))
        .collect();
    let rsp = roundtrip(&remote, &serde_json::to_string(&batch).unwrap()).await;
    assert_eq!(rsp.as_array().unwrap().len(), TOTAL);
    assert!(
        peak.load(Ordering::SeqCst) <= CAP,
        "peak concurrency {} exceeded cap {}",
        peak.load(Ordering::SeqCst),
        CAP
    );
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let assigner = test_assigner().insert(
        "Boom",
        handler::from_fn(|_ctx, _req| async move { panic!("blew up") }),
    );
    let (server, remote) = start(assigner, ServerOptions::new());
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":1,"method":"Boom"}"#).await;
    assert_eq!(rsp["error"]["code"], json!(-32603));
    assert!(rsp["error"]["message"].as_str().unwrap().contains("panicked"));

    // The server survives and keeps serving.
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":2,"method":"X"}"#).await;
    assert_eq!(rsp["result"], json!("a"));

    let mut snap = skiff_jsonrpc::metrics::Snapshot::default();
    server.metrics().snapshot(&mut snap);
    assert_eq!(snap.counters["handler.panic"], 1);
}

#[tokio::test]
async fn test_allow_v1_mirrors_dialect() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new().allow_v1(true));
    let rsp = roundtrip(&remote, r#"{"id":1,"method":"X"}"#).await;
    assert!(rsp.get("jsonrpc").is_none(), "v1 reply carries marker: {}", rsp);
    assert_eq!(rsp["result"], json!("a"));

    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":2,"method":"X"}"#).await;
    assert_eq!(rsp["jsonrpc"], json!("2.0"));
}

#[tokio::test]
async fn test_missing_marker_rejected_by_default() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    let rsp = roundtrip(&remote, r#"{"id":1,"method":"X"}"#).await;
    assert_eq!(rsp["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_server_info_reports_methods_and_metrics() {
    let (_server, remote) = start(test_assigner(), ServerOptions::new());
    roundtrip(&remote, r#"{"jsonrpc":"2.0","id":1,"method":"X"}"#).await;
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":2,"method":"rpc.serverInfo"}"#).await;
    let info = &rsp["result"];
    assert_eq!(info["methods"], json!(["Add", "N", "X", "Y"]));
    // Two requests so far: the call to X and this introspection call itself.
    assert_eq!(info["counters"]["rpc.requests"], json!(2));
    assert_eq!(info["max_values"]["rpc.batch-size"], json!(1));
}

#[tokio::test]
async fn test_reserved_prefix_not_routed_to_assigner() {
    let assigner = MethodMap::new().insert("rpc.shadow", handler::nullary(|_ctx| async move { Ok(1) }));
    let (_server, remote) = start(assigner, ServerOptions::new());
    let rsp = roundtrip(&remote, r#"{"jsonrpc":"2.0","id":1,"method":"rpc.shadow"}"#).await;
    assert_eq!(rsp["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn test_server_notifications() {
    let (server, remote) = start(test_assigner(), ServerOptions::new().allow_notify(true));
    server.notify("poke", json!({"seq": 1})).await.unwrap();
    let frame = timeout(LONG, remote.recv()).await.unwrap().unwrap().unwrap();
    let note: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(
        note,
        json!({"jsonrpc":"2.0","method":"poke","params":{"seq":1}})
    );
    assert!(note.get("id").is_none());
}

#[tokio::test]
async fn test_notify_disabled_by_default() {
    let (server, _remote) = start(test_assigner(), ServerOptions::new());
    assert!(server.notify("poke", ()).await.is_err());
}

#[tokio::test]
async fn test_metrics_counters() {
    let metrics = Arc::new(skiff_jsonrpc::metrics::Metrics::new());
    let (_server, remote) = start(
        test_assigner(),
        ServerOptions::new().metrics(Arc::clone(&metrics)),
    );
    roundtrip(
        &remote,
        r#"[{"jsonrpc":"2.0","id":1,"method":"X"},{"jsonrpc":"2.0","method":"N"},{"jsonrpc":"2.0","id":2,"method":"Gone"}]"#,
    )
    .await;
    let mut snap = skiff_jsonrpc::metrics::Snapshot::default();
    metrics.snapshot(&mut snap);
    assert_eq!(snap.counters["rpc.requests"], 2);
    assert_eq!(snap.counters["rpc.notifications"], 1);
    assert_eq!(snap.counters["rpc.errors"], 1);
    assert_eq!(snap.max_values["rpc.batch-size"], 3);
}

#[tokio::test]
async fn test_stop_cancels_in_flight_and_wait_returns() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let assigner = MethodMap::new().insert(
        "Hang",
        handler::from_fn(move |ctx, _req| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                ctx.cancelled().await;
                Err(ErrorObject::cancelled("request cancelled"))
            }
        }),
    );
    let (server, remote) = start(assigner, ServerOptions::new());
    remote
        .send(br#"{"jsonrpc":"2.0","id":1,"method":"Hang"}"#)
        .await
        .unwrap();
    timeout(LONG, started_rx.recv()).await.unwrap().unwrap();

    server.stop();
    timeout(LONG, server.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_eof_is_clean_shutdown() {
    let (server, remote) = start(test_assigner(), ServerOptions::new());
    remote.close().await.unwrap();
    timeout(LONG, server.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_decode_context_strips_metadata() {
    let assigner = MethodMap::new().insert(
        "Peek",
        handler::with_request(|ctx, req| async move {
            let args: Vec<i64> = req.params()?;
            Ok(json!({
                "args": args,
                "meta": ctx.metadata().cloned(),
            }))
        }),
    );
    let options = ServerOptions::new().decode_context(|params| {
        let wrapped: Value = match params {
            Some(raw) => serde_json::from_str(raw.get())
                .map_err(|_| ErrorObject::invalid_request("bad context wrapper"))?,
            None => return Ok((None, None)),
        };
        let meta = wrapped.get("meta").cloned();
        let inner = wrapped.get("payload").cloned().unwrap_or(Value::Null);
        let raw = serde_json::value::to_raw_value(&inner)
            .map_err(|_| ErrorObject::invalid_request("bad context wrapper"))?;
        Ok((Some(raw), meta))
    });
    let (_server, remote) = start(assigner, options);
    let rsp = roundtrip(
        &remote,
        r#"{"jsonrpc":"2.0","id":1,"method":"Peek","params":{"meta":{"who":"me"},"payload":[4,5]}}"#,
    )
    .await;
    assert_eq!(rsp["result"]["args"], json!([4, 5]));
    assert_eq!(rsp["result"]["meta"], json!({"who": "me"}));
}

#[tokio::test]
async fn test_late_result_is_transmitted() {
    // A handler that outlives its cancellation still has its result sent.
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let assigner = MethodMap::new().insert(
        "Stubborn",
        handler::from_fn(move |ctx, _req| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                ctx.cancelled().await;
                // Ignore the cancellation and answer anyway.
                Ok(json!("done anyway"))
            }
        }),
    );
    let (_server, remote) = start(assigner, ServerOptions::new());
    remote
        .send(br#"{"jsonrpc":"2.0","id":5,"method":"Stubborn"}"#)
        .await
        .unwrap();
    timeout(LONG, started_rx.recv()).await.unwrap().unwrap();
    remote
        .send(br#"{"jsonrpc":"2.0","method":"rpc.cancel","params":[5]}"#)
        .await
        .unwrap();
    let reply = timeout(LONG, remote.recv()).await.unwrap().unwrap().unwrap();
    let rsp: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(rsp["result"], json!("done anyway"));
}
