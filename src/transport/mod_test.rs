use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::models::Workarea;
use crate::transport::{Connection, ConnectionEvent, ConnectionEventKind, Listener, Message};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connected pair of connections, returning each along with its event queue.
async fn connection_pair() -> Result<((Connection, mpsc::Receiver<ConnectionEvent>), (Connection, mpsc::Receiver<ConnectionEvent>))> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let (client_tx, client_rx) = mpsc::channel(10);
    let (server_tx, server_rx) = mpsc::channel(10);
    let (client, accepted) = tokio::join!(Connection::connect(&addr, client_tx), listener.accept());
    let (socket, _addr) = accepted?;
    let server = Connection::spawn(socket, server_tx)?;
    Ok(((client?, client_rx), (server, server_rx)))
}

/// Receive the next event, skipping the `Opened` event of the connection.
async fn next_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> Result<ConnectionEvent> {
    loop {
        let event = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .context("timeout waiting for connection event")?
            .context("connection event queue closed")?;
        if !matches!(event.kind, ConnectionEventKind::Opened(_)) {
            return Ok(event);
        }
    }
}

#[tokio::test]
async fn records_are_delivered_in_send_order() -> Result<()> {
    let ((client, _client_rx), (server, mut server_rx)) = connection_pair().await?;

    let sender = tokio::spawn(async move {
        for step in 0..100u64 {
            let msg = Message::StepComplete { name: "worker-0".into(), step, vehicles: step * 2 };
            client.send(&msg).await?;
        }
        Ok::<_, TransportError>(client)
    });
    for expected in 0..100u64 {
        let event = next_event(&mut server_rx).await?;
        assert_eq!(event.conn, server.id(), "expected events to carry the receiving connection's id");
        match event.kind {
            ConnectionEventKind::Record(Message::StepComplete { step, vehicles, .. }) => {
                assert_eq!(step, expected, "records delivered out of order, expected step {} got {}", expected, step);
                assert_eq!(vehicles, expected * 2, "unexpected vehicle count {}", vehicles);
            }
            other => bail!("unexpected event {:?}", other),
        }
    }
    let _client = sender.await??;
    Ok(())
}

#[tokio::test]
async fn send_after_close_fails() -> Result<()> {
    let ((client, _client_rx), (_server, _server_rx)) = connection_pair().await?;

    client.close().await;

    assert!(client.is_closed(), "expected connection to report being closed");
    let res = client.send(&Message::Pause).await;
    assert!(matches!(res, Err(TransportError::Closed)), "expected send after close to fail, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn local_close_emits_one_closed_event() -> Result<()> {
    let ((client, mut client_rx), (_server, _server_rx)) = connection_pair().await?;

    client.close().await;

    let event = next_event(&mut client_rx).await?;
    assert!(matches!(event.kind, ConnectionEventKind::Closed(None)), "expected a clean close event, got {:?}", event.kind);
    let next = tokio::time::timeout(Duration::from_millis(200), client_rx.recv()).await;
    assert!(matches!(next, Ok(None) | Err(_)), "expected no events after close, got {:?}", next);
    Ok(())
}

#[tokio::test]
async fn peer_close_is_reported_after_pending_records() -> Result<()> {
    let ((client, _client_rx), (_server, mut server_rx)) = connection_pair().await?;

    client.send(&Message::ChangeSpeed { milliseconds: 50 }).await?;
    client.close().await;

    let event = next_event(&mut server_rx).await?;
    assert!(
        matches!(event.kind, ConnectionEventKind::Record(Message::ChangeSpeed { milliseconds: 50 })),
        "expected the pending record first, got {:?}",
        event.kind
    );
    let event = next_event(&mut server_rx).await?;
    assert!(matches!(event.kind, ConnectionEventKind::Closed(None)), "expected a clean close event, got {:?}", event.kind);
    Ok(())
}

#[tokio::test]
async fn malformed_record_closes_connection() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (socket, _addr) = accepted?;
    let (tx, mut rx) = mpsc::channel(10);
    let server = Connection::spawn(socket, tx)?;

    let mut raw = raw?;
    raw.write_all(b"{\"type\":\"warp_speed\"}\n").await?;

    let event = next_event(&mut rx).await?;
    assert!(
        matches!(event.kind, ConnectionEventKind::Closed(Some(TransportError::MalformedRecord(_)))),
        "expected malformed record close, got {:?}",
        event.kind
    );
    let res = server.send(&Message::Stop).await;
    assert!(matches!(res, Err(TransportError::Closed)), "expected send on failed connection to fail, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn partial_record_is_never_delivered() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (socket, _addr) = accepted?;
    let (tx, mut rx) = mpsc::channel(10);
    let _server = Connection::spawn(socket, tx)?;

    let mut raw = raw?;
    raw.write_all(b"{\"type\":\"pause\"}\n{\"type\":\"resu").await?;
    raw.shutdown().await?;

    let event = next_event(&mut rx).await?;
    assert!(matches!(event.kind, ConnectionEventKind::Record(Message::Pause)), "expected the complete record, got {:?}", event.kind);
    let event = next_event(&mut rx).await?;
    assert!(matches!(event.kind, ConnectionEventKind::Closed(Some(TransportError::Io(_)))), "expected an I/O close, got {:?}", event.kind);
    Ok(())
}

#[tokio::test]
async fn accepted_connections_open_before_delivering_records() -> Result<()> {
    let listener = Listener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let (client_tx, _client_rx) = mpsc::channel(10);
    let (server_tx, mut server_rx) = mpsc::channel(10);

    let client = Connection::connect(&addr, client_tx).await?;
    client.send(&Message::Resume).await?;
    let server = listener.accept(server_tx).await?;

    let event = tokio::time::timeout(TIMEOUT, server_rx.recv()).await?.context("connection event queue closed")?;
    match event.kind {
        ConnectionEventKind::Opened(conn) => assert_eq!(conn.id(), server.id(), "expected the opened handle to match the accepted connection"),
        other => bail!("expected an opened event first, got {:?}", other),
    }
    let event = next_event(&mut server_rx).await?;
    assert!(matches!(event.kind, ConnectionEventKind::Record(Message::Resume)), "expected the sent record, got {:?}", event.kind);
    Ok(())
}

#[test]
fn encoded_records_hold_exactly_one_line_break() -> Result<()> {
    let msg = Message::JoinRejected { name: "line\nbreak".into(), reason: "registry\r\nfull".into() };

    let record = msg.encode()?;

    assert_eq!(record.matches('\n').count(), 1, "expected a single line break, got {:?}", record);
    assert!(record.ends_with('\n'), "expected record to end with a line break, got {:?}", record);
    let decoded = Message::decode(record.as_bytes())?;
    assert_eq!(decoded, msg, "decoded record differs from original");
    Ok(())
}

#[test]
fn records_are_tagged_by_message_kind() -> Result<()> {
    let msg = Message::WorkareaAssignment {
        revision: 3,
        workareas: vec![Workarea::new("worker-0", [4, 2, 9].into_iter().collect())],
    };

    let record = msg.encode()?;

    let value: serde_json::Value = serde_json::from_str(&record)?;
    assert_eq!(value["type"], "workarea_assignment", "unexpected tag in {}", record);
    assert_eq!(value["workareas"][0]["cells"], serde_json::json!([2, 4, 9]), "expected ordered cell ids in {}", record);
    assert_eq!(Message::encode(&Message::Stop)?, "{\"type\":\"stop\"}\n", "unexpected unit variant encoding");
    Ok(())
}
