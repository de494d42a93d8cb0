//! Raw-socket peers speaking the JSON wire format directly.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use fedmesh_core::wire::{Envelope, Frame, PacketType};
use fedmesh_core::{CiphertextAlgebra, PlainAlgebra};
use fedmeshd::NodeEvent;

use crate::*;

async fn raw_peer() -> Result<(UdpSocket, String)> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?.to_string();
    Ok((socket, addr))
}

async fn recv_json(socket: &UdpSocket) -> Result<(serde_json::Value, SocketAddr)> {
    let mut buf = vec![0u8; 65_536];
    let (n, from) = tokio::time::timeout(EVENT_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("timed out waiting for datagram")??;
    Ok((serde_json::from_slice(&buf[..n])?, from))
}

#[tokio::test]
async fn test_handwritten_join_gets_params() -> Result<()> {
    let coordinator = plain_node().await?;
    let (raw, raw_addr) = raw_peer().await?;

    let join = serde_json::json!({
        "source": raw_addr,
        "destination": coordinator.address(),
        "type": "join",
        "message": "",
    });
    raw.send_to(join.to_string().as_bytes(), coordinator.address())
        .await?;

    let (reply, _) = recv_json(&raw).await?;
    assert_eq!(reply["type"], "params");
    assert_eq!(reply["source"], coordinator.address());
    assert_eq!(reply["destination"], raw_addr.as_str());
    assert_eq!(reply["params"]["inputDimensions"], 4);
    assert_eq!(reply["params"]["learningRate"], 0.01);
    assert_eq!(reply["params"]["activationFunction"], "sigmoid");

    assert_eq!(coordinator.participants().await, [raw_addr]);
    Ok(())
}

#[tokio::test]
async fn test_garbage_datagram_does_not_stop_listener() -> Result<()> {
    let node = plain_node().await?;
    let (raw, raw_addr) = raw_peer().await?;
    let mut events = node.subscribe();

    raw.send_to(b"{not json", node.address()).await?;
    raw.send_to(br#"{"source":"x","destination":"y","type":"leave"}"#, node.address())
        .await?;

    let text = serde_json::json!({
        "source": raw_addr,
        "destination": node.address(),
        "type": "",
        "message": "still there?",
    });
    raw.send_to(text.to_string().as_bytes(), node.address()).await?;

    let event = wait_for(&mut events, "text", |e| matches!(e, NodeEvent::TextReceived { .. })).await?;
    assert!(matches!(event, NodeEvent::TextReceived { message, .. } if message == "still there?"));
    Ok(())
}

/// A participant that never acknowledges fragments only fails its own
/// Result send; the other participant still gets the aggregate.
#[tokio::test]
async fn test_unresponsive_participant_does_not_block_others() -> Result<()> {
    let mut cfg = config();
    cfg.transport.ack_timeout_ms = 50;
    cfg.transport.max_retries = 1;
    let coordinator = plain_node_with(&cfg).await?;
    let a = plain_node().await?;
    let (raw, raw_addr) = raw_peer().await?;

    enroll(&a, coordinator.address()).await?;
    let join = Envelope::join(raw_addr.as_str(), coordinator.address()).into_frame();
    raw.send_to(&join.encode()?, coordinator.address()).await?;
    recv_json(&raw).await?; // params

    // 3 500 values are 56 000 hex characters: one unfragmented datagram from
    // the raw peer, but two fragments for the Result coming back.
    let len = 3_500;
    let mut a_events = a.subscribe();
    a.contribute(coordinator.address(), &vec![2.0; len]).await?;

    let ciphertext = PlainAlgebra.seal(&vec![4.0; len])?;
    let chunk = Envelope::new(
        raw_addr.as_str(),
        coordinator.address(),
        PacketType::EncryptedChunk,
        ciphertext,
    )
    .into_frame();
    raw.send_to(&chunk.encode()?, coordinator.address()).await?;

    let weights = applied_weights(&mut a_events).await?;
    assert!(approx_eq(&weights, &vec![3.0; len]));

    // The raw peer sees the first fragment, then its retransmission, and
    // never the terminal one.
    let mut indices = Vec::new();
    let mut buf = vec![0u8; 65_536];
    while let Ok(Ok((n, _))) =
        tokio::time::timeout(Duration::from_millis(300), raw.recv_from(&mut buf)).await
    {
        let frame = Frame::decode(&buf[..n])?;
        assert_eq!(frame.kind, PacketType::Result);
        indices.push(frame.fragment.context("result fragment without header")?.index);
    }
    assert_eq!(indices, [0, 0]);
    Ok(())
}
