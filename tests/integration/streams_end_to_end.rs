//! Chunked streams across linked buses: split, reassemble, abort.

use mb_test_utils::{init_tracing, linked_pair, linked_pair_with};
use mesh_bus::{BusOptions, Chunk, ErrorKind, IncomingStream};
use serde_json::{Map, json};
use std::time::Duration;
use tokio::sync::mpsc;

async fn accept_one(rx: &mut mpsc::UnboundedReceiver<IncomingStream>) -> IncomingStream {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("stream open should arrive")
        .expect("acceptor channel alive")
}

fn acceptor(bus: &mesh_bus::MessageBus) -> mpsc::UnboundedReceiver<IncomingStream> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.on_stream(move |incoming| {
        let _ = tx.send(incoming);
    })
    .unwrap();
    rx
}

#[tokio::test]
async fn binary_stream_collects_to_the_concatenation() {
    init_tracing();
    // Tiny chunk size so every write splits.
    let opts = BusOptions {
        chunk_size: 4,
        ..Default::default()
    };
    let (a, b) = linked_pair_with("a", "b", opts, BusOptions::default()).await;
    let mut streams = acceptor(&b);

    let writer = a.open_stream("b", "upload", None).await.unwrap();
    let buffers: Vec<Vec<u8>> = vec![vec![1, 2, 3, 4, 5, 6], vec![7], vec![8, 9, 10, 11, 12]];
    for buf in &buffers {
        writer.write_bytes(buf.clone()).await.unwrap();
    }
    writer.end().await.unwrap();

    let incoming = accept_one(&mut streams).await;
    assert_eq!(incoming.name, "upload");
    assert_eq!(incoming.peer_id, "a");
    let collected = incoming.collect().await.unwrap();
    let expected: Vec<u8> = buffers.concat();
    assert_eq!(collected, Chunk::Binary(expected));
}

#[tokio::test]
async fn text_stream_preserves_order_and_content() {
    let (a, b) = linked_pair("a", "b").await;
    let mut streams = acceptor(&b);

    let mut meta = Map::new();
    meta.insert("mime".to_owned(), json!("text/plain"));
    let writer = a.open_stream("b", "log", Some(meta)).await.unwrap();
    writer.write_text("hello ").await.unwrap();
    writer.write_text("stream ").await.unwrap();
    writer.write_text("world").await.unwrap();
    writer.end().await.unwrap();

    let incoming = accept_one(&mut streams).await;
    assert_eq!(
        incoming.meta.as_ref().unwrap()["mime"],
        json!("text/plain")
    );
    assert_eq!(
        incoming.collect().await.unwrap(),
        Chunk::Text("hello stream world".to_owned())
    );
}

#[tokio::test]
async fn chunks_arrive_individually_in_order() {
    let (a, b) = linked_pair("a", "b").await;
    let mut streams = acceptor(&b);

    let writer = a.open_stream("b", "feed", None).await.unwrap();
    for text in ["one", "two", "three"] {
        writer.write_text(text).await.unwrap();
    }
    writer.end().await.unwrap();

    let mut incoming = accept_one(&mut streams).await;
    let mut got = Vec::new();
    while let Some(chunk) = incoming.next_chunk().await.unwrap() {
        got.push(chunk);
    }
    assert_eq!(
        got,
        vec![
            Chunk::Text("one".into()),
            Chunk::Text("two".into()),
            Chunk::Text("three".into())
        ]
    );
}

#[tokio::test]
async fn abort_surfaces_the_reason_to_the_receiver() {
    let (a, b) = linked_pair("a", "b").await;
    let mut streams = acceptor(&b);

    let writer = a.open_stream("b", "doomed", None).await.unwrap();
    writer.write_text("partial").await.unwrap();
    writer.abort("source closed").await.unwrap();

    let mut incoming = accept_one(&mut streams).await;
    assert_eq!(
        incoming.next_chunk().await.unwrap(),
        Some(Chunk::Text("partial".into()))
    );
    let err = incoming.next_chunk().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ChannelFailed);
    assert_eq!(err.message, "source closed");
}

#[tokio::test]
async fn writer_is_single_use_after_end() {
    let (a, _b) = linked_pair("a", "b").await;
    let writer = a.open_stream("b", "once", None).await.unwrap();
    writer.end().await.unwrap();
    let err = writer.write_text("late").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ChannelClosed);
}

#[tokio::test]
async fn open_stream_to_unknown_peer_fails() {
    let (a, _b) = linked_pair("a", "b").await;
    let err = a.open_stream("ghost", "x", None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PeerNotFound);
}
