#![cfg(feature = "hec")]

use flate2::read::GzDecoder;
use log_dispatch_sink::{Attr, ErrorHandler, HecOptions, HecSink, Level, Record, Sink, SinkError};
use mockito::{Matcher, Server};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

const PATH: &str = "/services/collector/event";

fn options(server: &Server) -> HecOptions {
    HecOptions {
        api_token: "secret-token".into(),
        ingest_url: Some(format!("{}{}", server.url(), PATH)),
        scope: "site-42".into(),
        host: "web-1".into(),
        source: "checkout".into(),
        datasource_name: "checkout".into(),
        disable_async: true,
        disable_compression: true,
        ..Default::default()
    }
}

fn message_body(message: &str) -> Matcher {
    Matcher::Regex(format!(r#""message":"{message}","severity":"#))
}

#[tokio::test]
async fn batches_carry_collector_headers_and_ndjson() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("POST", PATH)
        .match_header("authorization", "Bearer secret-token")
        .match_header("content-type", "application/json")
        .match_header("s1-scope", "site-42")
        .match_header("content-encoding", Matcher::Missing)
        .match_body(message_body("first"))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("POST", PATH)
        .match_body(message_body("second"))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let sink = HecSink::new(options(&server)).unwrap();
    sink.handle(&Record::new(Level::INFO, "first")).await.unwrap();
    assert!(!first.matched_async().await);

    // the second record does not fit next to the first
    sink.handle(&Record::new(Level::INFO, "second")).await.unwrap();
    first.assert_async().await;
    assert!(!second.matched_async().await);

    sink.close().await.unwrap();
    second.assert_async().await;

    // nothing left to send
    sink.close().await.unwrap();
    second.assert_async().await;
}

#[tokio::test]
async fn small_records_share_one_batch() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .match_body(Matcher::Regex(
            r#"(?s)"message":"one".*\n.*"message":"two".*\n.*"message":"three".*\n$"#.into(),
        ))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let sink = HecSink::new(HecOptions {
        buffer_size: "64KiB".parse().unwrap(),
        ..options(&server)
    })
    .unwrap();
    for message in ["one", "two", "three"] {
        sink.handle(&Record::new(Level::WARN, message)).await.unwrap();
    }
    assert!(!mock.matched_async().await);
    sink.close().await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn compressed_batches_are_gzip() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .match_header("content-encoding", "gzip")
        .match_request(|request| {
            let Ok(body) = request.body() else {
                return false;
            };
            let mut text = String::new();
            GzDecoder::new(body.as_slice()).read_to_string(&mut text).is_ok()
                && text.contains(r#""message":"zipped""#)
        })
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let sink = HecSink::new(HecOptions {
        disable_compression: false,
        ..options(&server)
    })
    .unwrap();
    sink.handle(&Record::new(Level::ERROR, "zipped")).await.unwrap();
    sink.close().await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn async_delivery_runs_in_the_background() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .match_body(message_body("early"))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let sink = HecSink::new(HecOptions {
        disable_async: false,
        ..options(&server)
    })
    .unwrap();
    sink.handle(&Record::new(Level::INFO, "early")).await.unwrap();
    sink.handle(&Record::new(Level::INFO, "late")).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        while !mock.matched_async().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "batch was not delivered in time");
}

#[tokio::test]
async fn rejected_batches_reach_the_error_handler() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", PATH)
        .with_status(500)
        .with_body("ingest unavailable")
        .create_async()
        .await;

    let seen: Arc<Mutex<Vec<(u16, Option<String>)>>> = Arc::default();
    let captured = Arc::clone(&seen);
    let handler = ErrorHandler::new(move |err, record| {
        if let SinkError::Response { status, .. } = &err {
            captured
                .lock()
                .push((*status, record.map(|r| r.message.clone())));
        }
        Some(err)
    });

    let sink = HecSink::new(HecOptions {
        error_handler: Some(handler),
        ..options(&server)
    })
    .unwrap();
    sink.handle(&Record::new(Level::INFO, "a")).await.unwrap();

    let err = sink.handle(&Record::new(Level::INFO, "b")).await.unwrap_err();
    match err {
        SinkError::Response { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "ingest unavailable");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let err = sink.close().await.unwrap_err();
    assert!(matches!(err, SinkError::Response { status: 500, .. }));
    assert_eq!(
        *seen.lock(),
        vec![(500, Some("b".to_string())), (500, None)]
    );
}

#[tokio::test]
async fn suppressed_errors_are_not_returned() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", PATH)
        .with_status(503)
        .create_async()
        .await;

    let sink = HecSink::new(HecOptions {
        error_handler: Some(ErrorHandler::new(|_, _| None)),
        ..options(&server)
    })
    .unwrap();
    sink.handle(&Record::new(Level::INFO, "dropped")).await.unwrap();
    sink.close().await.unwrap();
}

#[tokio::test]
async fn derived_sinks_share_the_pending_batch() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .match_body(Matcher::Regex(
            r#"(?s)"message":"from base".*\n\{"time":\d+,"request":\{"id":7,"event":\{"message":"from child""#.into(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let base = HecSink::new(HecOptions {
        buffer_size: "64KiB".parse().unwrap(),
        ..options(&server)
    })
    .unwrap();
    let child = base
        .with_group("request")
        .with_attrs(vec![Attr::new("id", 7)]);

    base.handle(&Record::new(Level::INFO, "from base")).await.unwrap();
    child.handle(&Record::new(Level::INFO, "from child")).await.unwrap();
    base.close().await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn configured_sink_can_be_redirected_by_the_build_callback() {
    use log_dispatch_sink::{BuilderRegistry, SinkConfig, SinkOptionsMut};

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .match_header("authorization", "Bearer from-config")
        .match_header("s1-scope", "tenant-a")
        .match_body(message_body("configured"))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config: SinkConfig = serde_json::from_value(serde_json::json!({
        "type": "SentinelOne:HEC",
        "options": {
            "api_token": "from-config",
            "ingest_hostname": "collector.invalid",
            "scope": "tenant-a",
            "disable_async": true,
            "disable_compression": true,
            "send_timeout": 5
        }
    }))
    .unwrap();

    let url = format!("{}{}", server.url(), PATH);
    let callback = move |_: &str, options: SinkOptionsMut<'_>| -> Result<(), SinkError> {
        if let SinkOptionsMut::Hec(hec) = options {
            hec.ingest_url = Some(url.clone());
        }
        Ok(())
    };
    let sink = BuilderRegistry::default()
        .build(&config, Some(&callback))
        .unwrap();
    assert_eq!(sink.sink_type(), "sentinelone:hec");
    assert_eq!(sink.options()["send_timeout"], "5s");

    sink.handle(&Record::new(Level::INFO, "configured")).await.unwrap();
    sink.close().await.unwrap();
    mock.assert_async().await;
}

/// Mock that accepts every batch and keeps its decoded lines.
async fn recording_mock(server: &mut Server) -> (mockito::Mock, Arc<Mutex<Vec<String>>>) {
    let messages: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&messages);
    let mock = server
        .mock("POST", PATH)
        .with_status(200)
        .with_body_from_request(move |request| {
            let body = request.body().map(|b| b.clone()).unwrap_or_default();
            let text = String::from_utf8_lossy(&body);
            let mut seen = sink.lock();
            for line in text.lines() {
                let value: serde_json::Value = serde_json::from_str(line).unwrap_or_default();
                if let Some(message) = value["event"]["message"].as_str() {
                    seen.push(message.to_string());
                }
            }
            Vec::new()
        })
        .expect_at_least(1)
        .create_async()
        .await;
    (mock, messages)
}

async fn concurrent_producers(disable_async: bool) {
    const TASKS: usize = 8;
    const PER_TASK: usize = 50;

    let mut server = Server::new_async().await;
    let (_mock, messages) = recording_mock(&mut server).await;

    let sink: Arc<dyn Sink> = Arc::new(
        HecSink::new(HecOptions {
            buffer_size: "1KB".parse().unwrap(),
            disable_async,
            ..options(&server)
        })
        .unwrap(),
    );

    let producers: Vec<_> = (0..TASKS)
        .map(|task| {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                for n in 0..PER_TASK {
                    let record = Record::new(Level::INFO, format!("t{task}-r{n}"));
                    sink.handle(&record).await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    sink.close().await.unwrap();

    // async batches may still be in flight after close
    let expected = TASKS * PER_TASK;
    let arrived = tokio::time::timeout(Duration::from_secs(10), async {
        while messages.lock().len() < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(arrived.is_ok(), "only {} of {expected} records arrived", messages.lock().len());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut got = messages.lock().clone();
    got.sort();
    let mut want: Vec<String> = (0..TASKS)
        .flat_map(|task| (0..PER_TASK).map(move |n| format!("t{task}-r{n}")))
        .collect();
    want.sort();
    assert_eq!(got, want);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sync_producers_deliver_every_record_once() {
    concurrent_producers(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_async_producers_deliver_every_record_once() {
    concurrent_producers(false).await;
}
