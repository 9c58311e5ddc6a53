//! End-to-end request scenarios over an in-memory transport

use assert_matches::assert_matches;
use spdy_mux::{
    flags, Config, Frame, Handler, HandlerError, Request, Stream, StreamError, StreamState, SynReply,
};
use tokio::sync::mpsc;

use super::common::{data, get_request, pair, spawn_run, syn_stream, window_update, TIMEOUT};

struct Served {
    request: Request,
    body: Result<bytes::Bytes, StreamError>,
    state: StreamState,
}

/// Handler that reads the whole body, reports what it saw and returns.
fn recording_handler(tx: mpsc::UnboundedSender<Served>) -> impl Handler {
    move |stream: Stream, request: Request| {
        let tx = tx.clone();
        async move {
            let body = stream.read_to_end().await;
            let state = stream.state();
            tx.send(Served {
                request,
                body,
                state,
            })
            .ok();
            Ok::<(), HandlerError>(())
        }
    }
}

#[tokio::test]
async fn test_syn_stream_then_data() {
    let (conn, mut peer) = pair(Config::server());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = spawn_run(&conn, recording_handler(tx));

    peer.handshake().await;
    peer.send(syn_stream(1, 3, get_request(), false)).await;
    peer.send(data(1, b"hello", true)).await;

    let served = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(served.request.stream_id, 1);
    assert_eq!(served.request.priority, 3);
    assert_eq!(served.request.method(), Some("GET"));
    assert_eq!(served.request.path(), Some("/"));
    assert_eq!(served.body.unwrap(), &b"hello"[..]);
    assert_eq!(served.state, StreamState::HalfClosedRemote);

    // Handler returned without writing: default 200 reply closes the stream
    match peer.recv().await {
        Frame::SynReply(SynReply {
            flags: reply_flags,
            stream_id,
            headers,
        }) => {
            assert_eq!(stream_id, 1);
            assert_eq!(reply_flags, flags::FIN);
            assert_eq!(headers.get(":status"), Some("200"));
            assert_eq!(headers.get(":version"), Some("HTTP/1.1"));
        }
        other => panic!("expected SYN_REPLY, got {:?}", other),
    }

    // Invoked exactly once
    assert!(rx.try_recv().is_err());
    assert_eq!(conn.stream_count(), 0);

    conn.close();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_body_order_across_window_update() {
    let (conn, mut peer) = pair(Config::server());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _run = spawn_run(&conn, recording_handler(tx));

    peer.handshake().await;
    peer.send(syn_stream(1, 0, get_request(), false)).await;
    peer.send(data(1, b"first,", false)).await;
    peer.send(window_update(1, 1024)).await;
    peer.send(data(1, b"second", true)).await;

    let served = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(served.body.unwrap(), &b"first,second"[..]);
    conn.close();
}

#[tokio::test]
async fn test_large_write_waits_for_window() {
    let (conn, mut peer) = pair(Config::server());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |stream: Stream, _request: Request| {
        let tx = tx.clone();
        async move {
            let accepted = stream.write(&vec![0x42; 100_000])?;
            tx.send((accepted, stream.queued_bytes())).ok();
            Ok::<(), HandlerError>(())
        }
    };
    let _run = spawn_run(&conn, handler);

    peer.handshake().await;
    peer.send(syn_stream(1, 2, get_request(), true)).await;

    let (accepted, queued) = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(accepted, 100_000);
    assert_eq!(queued, 34_464);

    assert_matches!(peer.recv().await, Frame::SynReply(reply) if reply.flags == 0);
    match peer.recv().await {
        Frame::Data(frame) => {
            assert_eq!(frame.stream_id, 1);
            assert_eq!(frame.data.len(), 65_536);
            assert_eq!(frame.flags, 0);
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    peer.send(window_update(1, 40_000)).await;
    match peer.recv().await {
        Frame::Data(frame) => {
            assert_eq!(frame.data.len(), 34_464);
            assert_eq!(frame.flags, flags::FIN);
        }
        other => panic!("expected DATA, got {:?}", other),
    }
    conn.close();
}

#[tokio::test]
async fn test_explicit_reply_and_body() {
    let (conn, mut peer) = pair(Config::server());
    let handler = |stream: Stream, request: Request| async move {
        stream.set_header("content-type", "text/plain");
        stream.write_header(201)?;
        stream.write(format!("path={}", request.path().unwrap_or("")).as_bytes())?;
        Ok::<(), HandlerError>(())
    };
    let _run = spawn_run(&conn, handler);

    peer.handshake().await;
    peer.send(syn_stream(1, 0, get_request(), true)).await;

    match peer.recv().await {
        Frame::SynReply(reply) => {
            assert_eq!(reply.flags, 0);
            assert_eq!(reply.headers.get(":status"), Some("201"));
            assert_eq!(reply.headers.get("content-type"), Some("text/plain"));
        }
        other => panic!("expected SYN_REPLY, got {:?}", other),
    }
    assert_eq!(peer.recv().await, data(1, b"path=/", false));
    assert_eq!(peer.recv().await, data(1, b"", true));
    conn.close();
}

#[tokio::test]
async fn test_handler_error_before_reply_resets() {
    let (conn, mut peer) = pair(Config::server());
    let handler = |_stream: Stream, _request: Request| async move {
        Err::<(), HandlerError>(HandlerError::Aborted("nope".to_string()))
    };
    let _run = spawn_run(&conn, handler);

    peer.handshake().await;
    peer.send(syn_stream(1, 0, get_request(), true)).await;
    assert_matches!(
        peer.recv().await,
        Frame::RstStream(rst) if rst.stream_id == 1
            && rst.status == spdy_mux::rst_status::INTERNAL_ERROR
    );
    conn.close();
}

#[tokio::test]
async fn test_handler_error_after_reply_cancels() {
    let (conn, mut peer) = pair(Config::server());
    let handler = |stream: Stream, _request: Request| async move {
        stream.write_header(200)?;
        Err::<(), HandlerError>(HandlerError::Aborted("gave up".to_string()))
    };
    let _run = spawn_run(&conn, handler);

    peer.handshake().await;
    peer.send(syn_stream(1, 0, get_request(), true)).await;
    assert_matches!(peer.recv().await, Frame::SynReply(_));
    assert_matches!(
        peer.recv().await,
        Frame::RstStream(rst) if rst.status == spdy_mux::rst_status::CANCEL
    );
    conn.close();
}

#[tokio::test]
async fn test_client_request_response() {
    let (conn, mut peer) = pair(Config::client());
    let _run = spawn_run(&conn, |_stream: Stream, _request: Request| async move {
        Ok::<(), HandlerError>(())
    });

    let settings = peer.handshake().await;
    assert_eq!(
        settings.get(spdy_mux::settings_id::INITIAL_WINDOW_SIZE).map(|s| s.value),
        Some(10 * 1024 * 1024)
    );

    let stream = conn.open_stream(get_request(), 1, true).unwrap();
    assert_eq!(stream.id(), 1);
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    match peer.recv().await {
        Frame::SynStream(syn) => {
            assert_eq!(syn.stream_id, 1);
            assert_eq!(syn.priority, 1);
            assert_eq!(syn.flags, flags::FIN);
            assert_eq!(syn.headers.get(":path"), Some("/"));
        }
        other => panic!("expected SYN_STREAM, got {:?}", other),
    }

    let mut reply = spdy_mux::Headers::new();
    reply.set(":status", "200");
    reply.set(":version", "HTTP/1.1");
    peer.send(Frame::SynReply(SynReply {
        flags: 0,
        stream_id: 1,
        headers: reply,
    }))
    .await;
    peer.send(data(1, b"response body", true)).await;

    let headers = tokio::time::timeout(TIMEOUT, stream.reply_headers())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(headers.get(":status"), Some("200"));
    let body = tokio::time::timeout(TIMEOUT, stream.read_to_end())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body, &b"response body"[..]);
    assert_eq!(stream.state(), StreamState::Closed);
    conn.close();
}

#[tokio::test]
async fn test_cancelled_handler_resets_stream() {
    let (conn, mut peer) = pair(Config::server());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |stream: Stream, _request: Request| {
        let tx = tx.clone();
        async move {
            stream.write_header(200)?;
            stream.cancel();
            tx.send(stream.write_header(201)).ok();
            Err::<(), HandlerError>(HandlerError::Aborted("cancelled".to_string()))
        }
    };
    let _run = spawn_run(&conn, handler);

    peer.handshake().await;
    peer.send(syn_stream(1, 0, get_request(), true)).await;
    assert_matches!(peer.recv().await, Frame::SynReply(reply) if reply.stream_id == 1);
    assert_matches!(
        peer.recv().await,
        Frame::RstStream(rst) if rst.stream_id == 1
            && rst.status == spdy_mux::rst_status::CANCEL
    );
    assert_eq!(
        tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap(),
        Err(StreamError::Cancelled(1))
    );
    assert_eq!(conn.stream_count(), 0);
    conn.close();
}
