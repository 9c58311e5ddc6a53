//! Connection-level control frames: PING, SETTINGS, GOAWAY, CREDENTIAL

use std::time::Duration;

use assert_matches::assert_matches;
use spdy_mux::{
    goaway_status, rst_status, settings_id, Config, ConnectionError, Credential, Frame, GoAway,
    HandlerError, Headers, Ping, Request, Settings, Stream, StreamError, SynReply,
};

use super::common::{get_request, pair, pair_with_capacity, spawn_run, syn_stream, Peer, TIMEOUT};

async fn noop(_stream: Stream, _request: Request) -> Result<(), HandlerError> {
    Ok(())
}

/// Holds the stream open until the peer ends it.
async fn drain(stream: Stream, _request: Request) -> Result<(), HandlerError> {
    stream.read_to_end().await?;
    Ok(())
}

/// Round trip a PING the peer owns, so everything sent before it has been
/// processed once the echo arrives.
async fn sync(peer: &mut Peer, id: u32) {
    peer.send(Frame::Ping(Ping { id })).await;
    assert_eq!(peer.recv().await, Frame::Ping(Ping { id }));
}

/// Next GOAWAY, skipping whatever stream traffic precedes it.
async fn recv_goaway(peer: &mut Peer) -> GoAway {
    loop {
        match peer.recv().await {
            Frame::GoAway(goaway) => return goaway,
            Frame::SynReply(_) | Frame::Data(_) => continue,
            other => panic!("expected GOAWAY, got {:?}", other),
        }
    }
}

// ============================================================================
// PING
// ============================================================================

#[tokio::test]
async fn test_peer_ping_is_echoed() {
    let (conn, mut peer) = pair(Config::server());
    let _run = spawn_run(&conn, noop);

    peer.handshake().await;
    sync(&mut peer, 1).await;

    // An even id belongs to the server and none is outstanding
    peer.send(Frame::Ping(Ping { id: 2 })).await;
    sync(&mut peer, 3).await;
    assert_eq!(conn.benign_errors(), 1);
    conn.close();
}

#[tokio::test]
async fn test_ping_echoes_capped_while_peer_stalls() {
    let config = Config::server().with_max_queued_replies(8);
    let (conn, mut peer) = pair_with_capacity(config, 64);
    let _run = spawn_run(&conn, noop);

    // Nothing is read yet, so the send loop stalls once the transport fills
    for n in 0..100 {
        peer.send(Frame::Ping(Ping { id: n * 2 + 1 })).await;
    }
    // Stored settings mark the end of what the read loop has to process
    let mut settings = Settings::default();
    settings.add(0, settings_id::MAX_CONCURRENT_STREAMS, 10);
    peer.send(Frame::Settings(settings)).await;
    tokio::time::timeout(TIMEOUT, async {
        while conn.settings().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    // Eight queued, a few more already handed to the transport
    let dropped = conn.benign_errors();
    assert!((80..=92).contains(&dropped), "dropped {} echoes", dropped);

    peer.handshake().await;
    let mut last = 0;
    for _ in 0..(100 - dropped) {
        match peer.recv().await {
            Frame::Ping(ping) => {
                assert!(ping.id > last);
                last = ping.id;
            }
            other => panic!("expected PING, got {:?}", other),
        }
    }
    sync(&mut peer, 201).await;
    assert!(!conn.is_closed());
    conn.close();
}

#[tokio::test]
async fn test_ping_round_trip() {
    let (conn, mut peer) = pair(Config::server());
    let _run = spawn_run(&conn, noop);
    peer.handshake().await;

    let pinger = conn.clone();
    let ping = tokio::spawn(async move { pinger.ping().await });
    let id = match peer.recv().await {
        Frame::Ping(ping) => ping.id,
        other => panic!("expected PING, got {:?}", other),
    };
    assert_eq!(id % 2, 0);
    peer.send(Frame::Ping(Ping { id })).await;

    let rtt = tokio::time::timeout(TIMEOUT, ping).await.unwrap().unwrap();
    assert!(rtt.is_ok());
    conn.close();
}

#[tokio::test]
async fn test_pending_ping_fails_on_close() {
    let (conn, mut peer) = pair(Config::client());
    let _run = spawn_run(&conn, noop);
    peer.handshake().await;

    let pinger = conn.clone();
    let ping = tokio::spawn(async move { pinger.ping().await });
    assert_matches!(peer.recv().await, Frame::Ping(ping) if ping.id % 2 == 1);
    conn.close();
    assert_matches!(
        tokio::time::timeout(TIMEOUT, ping).await.unwrap().unwrap(),
        Err(ConnectionError::Closed)
    );
}

// ============================================================================
// SETTINGS
// ============================================================================

#[tokio::test]
async fn test_initial_settings() {
    let (conn, mut peer) = pair(Config::server());
    let _run = spawn_run(&conn, noop);

    let settings = peer.handshake().await;
    assert_eq!(
        settings.get(settings_id::MAX_CONCURRENT_STREAMS).map(|s| s.value),
        Some(1000)
    );
    assert_eq!(
        settings.get(settings_id::INITIAL_WINDOW_SIZE).map(|s| s.value),
        Some(64 * 1024)
    );
    conn.close();
}

#[tokio::test]
async fn test_peer_stream_limit() {
    let (conn, mut peer) = pair(Config::client());
    let _run = spawn_run(&conn, noop);
    peer.handshake().await;

    let mut settings = Settings::default();
    settings.add(0, settings_id::MAX_CONCURRENT_STREAMS, 1);
    peer.send(Frame::Settings(settings)).await;
    sync(&mut peer, 2).await;

    assert_eq!(conn.settings().len(), 1);
    let first = conn.open_stream(get_request(), 0, false);
    assert!(first.is_ok());
    assert_matches!(
        conn.open_stream(get_request(), 0, false),
        Err(ConnectionError::StreamLimit(1))
    );
    conn.close();
}

#[tokio::test]
async fn test_local_stream_limit_refuses() {
    let config = Config::server().with_max_concurrent_streams(Some(1));
    let (conn, mut peer) = pair(config);
    let _run = spawn_run(&conn, drain);
    peer.handshake().await;

    peer.send(syn_stream(1, 0, get_request(), false)).await;
    peer.send(syn_stream(3, 0, get_request(), false)).await;
    assert_matches!(
        peer.recv().await,
        Frame::RstStream(rst) if rst.stream_id == 3 && rst.status == rst_status::REFUSED_STREAM
    );
    assert_eq!(conn.stream_count(), 1);
    conn.close();
}

// ============================================================================
// GOAWAY
// ============================================================================

#[tokio::test]
async fn test_goaway_without_streams_closes() {
    let (conn, mut peer) = pair(Config::server());
    let run = spawn_run(&conn, noop);
    peer.handshake().await;

    peer.send(Frame::GoAway(GoAway {
        last_good_stream_id: 0,
        status: goaway_status::OK,
    }))
    .await;
    peer.expect_eof().await;
    assert!(tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap().is_ok());
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_goaway_refuses_unprocessed_streams() {
    let (conn, mut peer) = pair(Config::client());
    let run = spawn_run(&conn, noop);
    peer.handshake().await;

    let stream = conn.open_stream(get_request(), 0, true).unwrap();
    assert_matches!(peer.recv().await, Frame::SynStream(_));
    peer.send(Frame::GoAway(GoAway {
        last_good_stream_id: 0,
        status: goaway_status::OK,
    }))
    .await;

    assert_eq!(
        tokio::time::timeout(TIMEOUT, stream.reply_headers()).await.unwrap(),
        Err(StreamError::Reset {
            stream_id: 1,
            status: rst_status::REFUSED_STREAM
        })
    );
    assert!(tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap().is_ok());
    assert_matches!(
        conn.open_stream(get_request(), 0, true),
        Err(ConnectionError::Closed)
    );
}

#[tokio::test]
async fn test_goaway_keeps_streams_up_to_last_good() {
    let (conn, mut peer) = pair(Config::client());
    let run = spawn_run(&conn, noop);
    peer.handshake().await;

    let first = conn.open_stream(get_request(), 0, true).unwrap();
    let second = conn.open_stream(get_request(), 0, true).unwrap();
    assert_eq!((first.id(), second.id()), (1, 3));
    assert_matches!(peer.recv().await, Frame::SynStream(syn) if syn.stream_id == 1);
    assert_matches!(peer.recv().await, Frame::SynStream(syn) if syn.stream_id == 3);

    peer.send(Frame::GoAway(GoAway {
        last_good_stream_id: 1,
        status: goaway_status::OK,
    }))
    .await;
    assert_eq!(
        tokio::time::timeout(TIMEOUT, second.reply_headers()).await.unwrap(),
        Err(StreamError::Reset {
            stream_id: 3,
            status: rst_status::REFUSED_STREAM
        })
    );
    assert_eq!(conn.stream_count(), 1);
    assert!(!conn.is_closed());
    assert_matches!(
        conn.open_stream(get_request(), 0, true),
        Err(ConnectionError::GoingAway)
    );

    // Stream 1 was processed and still completes normally
    let mut reply = Headers::new();
    reply.set(":status", "200");
    reply.set(":version", "HTTP/1.1");
    peer.send(Frame::SynReply(SynReply {
        flags: spdy_mux::flags::FIN,
        stream_id: 1,
        headers: reply,
    }))
    .await;
    let headers = tokio::time::timeout(TIMEOUT, first.reply_headers())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(headers.get(":status"), Some("200"));
    assert!(tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn test_shutdown_sends_goaway() {
    let (conn, mut peer) = pair(Config::server());
    let run = spawn_run(&conn, noop);
    peer.handshake().await;
    sync(&mut peer, 1).await;

    conn.shutdown().await;
    assert_eq!(
        recv_goaway(&mut peer).await,
        GoAway {
            last_good_stream_id: 0,
            status: goaway_status::OK
        }
    );
    peer.expect_eof().await;
    assert!(tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn test_stream_after_goaway_sent_is_refused() {
    let (conn, mut peer) = pair(Config::server());
    let _run = spawn_run(&conn, drain);
    peer.handshake().await;

    peer.send(syn_stream(1, 0, get_request(), false)).await;
    sync(&mut peer, 1).await;
    let shutdown = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.shutdown().await })
    };
    assert_eq!(recv_goaway(&mut peer).await.last_good_stream_id, 1);

    peer.send(syn_stream(3, 0, get_request(), false)).await;
    assert_matches!(
        peer.recv().await,
        Frame::RstStream(rst) if rst.stream_id == 3 && rst.status == rst_status::REFUSED_STREAM
    );
    conn.close();
    tokio::time::timeout(TIMEOUT, shutdown).await.unwrap().unwrap();
}

// ============================================================================
// Protocol errors
// ============================================================================

async fn assert_protocol_error(
    mut peer: Peer,
    run: tokio::task::JoinHandle<Result<(), ConnectionError>>,
    last_good: u32,
) {
    let goaway = recv_goaway(&mut peer).await;
    assert_eq!(goaway.status, goaway_status::PROTOCOL_ERROR);
    assert_eq!(goaway.last_good_stream_id, last_good);
    peer.expect_eof().await;
    assert_matches!(
        tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap(),
        Err(ConnectionError::Protocol {
            status: goaway_status::PROTOCOL_ERROR,
            ..
        })
    );
}

#[tokio::test]
async fn test_wrong_parity_stream_id() {
    let (conn, mut peer) = pair(Config::server());
    let run = spawn_run(&conn, noop);
    peer.handshake().await;

    peer.send(syn_stream(2, 0, get_request(), true)).await;
    assert_protocol_error(peer, run, 0).await;
}

#[tokio::test]
async fn test_decreasing_stream_id() {
    let (conn, mut peer) = pair(Config::server());
    let run = spawn_run(&conn, drain);
    peer.handshake().await;

    peer.send(syn_stream(3, 0, get_request(), false)).await;
    peer.send(syn_stream(1, 0, get_request(), false)).await;
    assert_protocol_error(peer, run, 3).await;
}

#[tokio::test]
async fn test_bad_header_block_is_fatal() {
    let (conn, mut peer) = pair(Config::server());
    let run = spawn_run(&conn, noop);
    peer.handshake().await;

    let mut raw = vec![0x80, 3, 0, 1, 0, 0, 0, 14];
    raw.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    raw.extend_from_slice(&[1, 2, 3, 4]);
    peer.send_raw(&raw).await;
    assert_protocol_error(peer, run, 0).await;
}

#[tokio::test]
async fn test_unknown_control_frame_ignored() {
    let (conn, mut peer) = pair(Config::server());
    let _run = spawn_run(&conn, noop);
    peer.handshake().await;

    peer.send_raw(&[0x80, 3, 0, 0x0f, 0, 0, 0, 4, 1, 2, 3, 4]).await;
    sync(&mut peer, 1).await;
    assert_eq!(conn.benign_errors(), 1);
    assert!(!conn.is_closed());
    conn.close();
}

// ============================================================================
// CREDENTIAL
// ============================================================================

#[tokio::test]
async fn test_credential_is_stored() {
    let (conn, mut peer) = pair(Config::server());
    let _run = spawn_run(&conn, noop);
    peer.handshake().await;

    peer.send(Frame::Credential(Credential {
        slot: 1,
        proof: b"proof".to_vec(),
        certificates: vec![b"leaf".to_vec(), b"root".to_vec()],
    }))
    .await;
    peer.send(Frame::Credential(Credential {
        slot: 0,
        proof: Vec::new(),
        certificates: vec![b"ignored".to_vec()],
    }))
    .await;
    sync(&mut peer, 1).await;

    assert_eq!(
        conn.credentials(1),
        Some(vec![b"leaf".to_vec(), b"root".to_vec()])
    );
    assert_eq!(conn.credentials(0), None);
    assert_eq!(conn.benign_errors(), 1);
    conn.close();
}
