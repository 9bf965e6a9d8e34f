use crate::*;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, LocalSet};

use vista_channel::cursor::{self, CursorCommand, Point};
use vista_channel::{driver, transport};

const STEP: Duration = Duration::from_secs(5);

/// A cursor client served over a loopback socket by the tokio driver.
struct Served {
    channel: CursorChannel,
    client: SharedClient<CursorHandler>,
    peer: TcpStream,
    driver: JoinHandle<()>,
    shutdown: broadcast::Sender<()>,
}

/// Must run inside a `LocalSet`.
async fn serve_cursor() -> Result<Served> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let peer = TcpStream::connect(addr).await.context("connect")?;
    let (server, _) = listener.accept().await.context("accept")?;

    let mut channel = CursorChannel::new(0);
    let (stream, io) = transport::tcp(server);
    let client = ChannelClient::new(
        channel.channel().info().clone(),
        Capabilities::from_bits(&[], &[caps::cursor::CURSOR_CACHE]),
        stream,
        ClientSettings::default(),
        CursorHandler::default(),
    );
    let client = channel.add_client(client);

    let (shutdown, _) = broadcast::channel(1);
    let driver = tokio::task::spawn_local(driver::drive(client.clone(), io, shutdown.subscribe()));
    Ok(Served {
        channel,
        client,
        peer,
        driver,
        shutdown,
    })
}

async fn read_message(stream: &mut TcpStream) -> Result<(MessageHeader, Vec<u8>)> {
    let mut head = vec![0u8; HeaderKind::Full.size()];
    tokio::time::timeout(STEP, stream.read_exact(&mut head))
        .await
        .context("timed out waiting for a header")??;
    let header = HeaderKind::Full.read(&head)?;
    let mut body = vec![0u8; header.size as usize];
    tokio::time::timeout(STEP, stream.read_exact(&mut body))
        .await
        .context("timed out waiting for a body")??;
    Ok((header, body))
}

async fn write_message(stream: &mut TcpStream, msg_type: u16, serial: u64, body: &[u8]) -> Result<()> {
    let header = MessageHeader {
        msg_type,
        size: body.len() as u32,
        serial,
        sub_list: 0,
    };
    let mut buf = vec![0u8; HeaderKind::Full.size()];
    HeaderKind::Full.write(&header, &mut buf)?;
    buf.extend_from_slice(body);
    stream.write_all(&buf).await?;
    Ok(())
}

async fn expect_eof(stream: &mut TcpStream) -> Result<()> {
    let mut byte = [0u8; 1];
    let n = tokio::time::timeout(STEP, stream.read(&mut byte))
        .await
        .context("timed out waiting for the server to close")??;
    if n != 0 {
        bail!("expected EOF, read a byte");
    }
    Ok(())
}

#[tokio::test]
async fn cursor_client_over_tcp() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let mut s = serve_cursor().await?;

            let (set_ack, _) = read_message(&mut s.peer).await?;
            let (init, _) = read_message(&mut s.peer).await?;
            assert_eq!((set_ack.msg_type, set_ack.serial), (msg::SET_ACK, 1));
            assert_eq!((init.msg_type, init.serial), (cursor::msg::INIT, 2));

            s.channel.process_cmd(CursorCommand::Move(Point { x: 10, y: 20 }));
            let (moved, body) = read_message(&mut s.peer).await?;
            assert_eq!(moved.msg_type, cursor::msg::MOVE);
            assert_eq!(body, [10, 0, 20, 0]);

            // An answered ack generation is fine; junk is not.
            write_message(&mut s.peer, msgc::ACK_SYNC, 1, &1u32.to_le_bytes()).await?;
            write_message(&mut s.peer, msgc::ACK, 2, &[]).await?;
            write_message(&mut s.peer, 150, 3, b"junk").await?;
            expect_eof(&mut s.peer).await?;

            tokio::time::timeout(STEP, &mut s.driver)
                .await
                .context("driver did not stop")??;
            assert!(!s.client.borrow().is_connected());
            assert_eq!(s.client.borrow().stats().messages_sent, 3);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test]
async fn shutdown_stops_the_driver_and_closes_the_socket() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let mut s = serve_cursor().await?;
            read_message(&mut s.peer).await?;
            read_message(&mut s.peer).await?;

            s.shutdown.send(()).ok();
            tokio::time::timeout(STEP, &mut s.driver)
                .await
                .context("driver did not stop")??;
            assert!(!s.client.borrow().is_connected());
            expect_eof(&mut s.peer).await?;

            assert_eq!(s.channel.channel_mut().reap(), 1);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test]
async fn peer_hangup_ends_the_driver() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let s = serve_cursor().await?;
            drop(s.peer);
            tokio::time::timeout(STEP, s.driver)
                .await
                .context("driver did not stop")??;
            assert!(!s.client.borrow().is_connected());
            anyhow::Ok(())
        })
        .await
}
