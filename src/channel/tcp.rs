use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::channel::{Channel, InboundCallback};
use crate::endpoint::{ChannelEndpoint, Transport};
use crate::error::FabricError;

/// A long-lived framed TCP connection: a 4-byte big-endian length prefix
/// followed by the envelope body. Idle connections past `max_idle` are
/// closed by the reaper in [`crate::channel::registry::ChannelRegistry`].
pub struct TcpChannel {
    peer: ChannelEndpoint,
    write_half: Mutex<OwnedWriteHalf>,
    last_used: AtomicI64,
}

impl TcpChannel {
    fn touch(&self) {
        self.last_used.store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_used.load(Ordering::Relaxed);
        let elapsed_ms = (now_millis() - last).max(0);
        Duration::from_millis(elapsed_ms as u64)
    }

    pub async fn connect(addr: SocketAddr, on_receive: InboundCallback) -> Result<Arc<TcpChannel>, FabricError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream, addr, on_receive))
    }

    pub fn from_stream(stream: TcpStream, addr: SocketAddr, on_receive: InboundCallback) -> Arc<TcpChannel> {
        let peer = ChannelEndpoint::new(Transport::Tcp, addr.ip(), addr.port());
        let (read_half, write_half) = stream.into_split();
        let channel = Arc::new(TcpChannel {
            peer,
            write_half: Mutex::new(write_half),
            last_used: AtomicI64::new(now_millis()),
        });
        let reader_channel = channel.clone();
        tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        reader_channel.touch();
                        on_receive(peer, frame);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "tcp channel read error, closing");
                        break;
                    }
                }
            }
        });
        channel
    }

    pub async fn serve(
        listen_addr: SocketAddr,
        backlog: u32,
        on_receive: InboundCallback,
        registry: Arc<super::registry::ChannelRegistry>,
    ) -> Result<(), FabricError> {
        let _ = backlog; // tokio's TcpListener manages its own accept backlog
        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!(%listen_addr, "tcp channel listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let channel = TcpChannel::from_stream(stream, addr, on_receive.clone());
            registry.insert(channel);
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn endpoint(&self) -> ChannelEndpoint {
        self.peer
    }

    async fn transmit(&self, payload: &[u8]) -> Result<(), FabricError> {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        {
            let mut guard = self.write_half.lock().await;
            guard.write_all(&framed).await?;
        }
        self.touch();
        Ok(())
    }
}

async fn read_frame(read_half: &mut tokio::net::tcp::OwnedReadHalf) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match read_half.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    read_half.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
