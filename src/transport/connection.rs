//! Stream-backed connection driver
//!
//! Splits a byte stream into a writer task fed by an unbounded channel and
//! a reader loop that pushes every chunk into the engine. The engine is
//! online until the reader loop ends or a write fails, whichever comes
//! first.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::engine::Engine;
use crate::error::Result;

use super::Transport;

/// Transport that hands frames to a writer task
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its writer task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, text: &str) -> io::Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(text.as_bytes()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task closed"))
    }
}

/// Drives one endpoint stream for an engine
pub struct Connection<S> {
    engine: Arc<Engine>,
    stream: S,
}

impl Connection<TcpStream> {
    /// Connect to an endpoint over TCP
    pub async fn connect(engine: Arc<Engine>, addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(endpoint = %engine.name(), peer = %addr, "Connected");
        Ok(Self::new(engine, stream))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an already-connected stream
    pub fn new(engine: Arc<Engine>, stream: S) -> Self {
        Self { engine, stream }
    }

    /// Run until the peer closes the stream or a read fails
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run until the stream ends or `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self { engine, stream } = self;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (transport, mut rx) = ChannelTransport::new();

        let endpoint = engine.name().to_string();
        let (failed_tx, failed_rx) = oneshot::channel::<io::Error>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let written = match writer.write_all(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    tracing::error!(endpoint = %endpoint, error = %e, "Write failed");
                    let _ = failed_tx.send(e);
                    return;
                }
            }
        });

        // Resolves only if the writer gave up on the stream
        let writer_failed = async {
            match failed_rx.await {
                Ok(e) => e,
                Err(_) => std::future::pending::<io::Error>().await,
            }
        };

        engine.attach_transport(Arc::new(transport));
        engine.set_online(true);

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!(endpoint = %engine.name(), "Shutdown signal received");
                Ok(())
            }
            e = writer_failed => Err(e.into()),
            result = Self::read_loop(&engine, &mut reader) => result,
        };

        engine.set_online(false);
        engine.detach_transport();
        writer_task.abort();

        tracing::debug!(endpoint = %engine.name(), "Connection closed");
        result
    }

    async fn read_loop(engine: &Engine, reader: &mut ReadHalf<S>) -> Result<()> {
        let mut buf = vec![0u8; engine.config().read_buffer_size.max(1)];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                tracing::debug!(endpoint = %engine.name(), "Peer closed stream");
                return Ok(());
            }
            engine.on_data(&buf[..n]);
        }
    }
}
