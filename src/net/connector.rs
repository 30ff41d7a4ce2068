use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::{net::TcpStream, time::timeout};

/// Byte stream a negotiator talks over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedStream = Box<dyn Transport>;

/// Opens outbound connections to sources.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        connect_timeout: Duration,
    ) -> BoxFuture<'a, std::io::Result<BoxedStream>>;
}

/// Plain TCP with a connect timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        connect_timeout: Duration,
    ) -> BoxFuture<'a, std::io::Result<BoxedStream>> {
        Box::pin(async move {
            let target = format!("{host}:{port}");
            match timeout(connect_timeout, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(%target, "tcp connect OK");
                    Ok(Box::new(stream) as BoxedStream)
                }
                Ok(Err(err)) => {
                    tracing::debug!(%target, error = %err, "tcp connect failed");
                    Err(err)
                }
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("tcp connect to {target} timed out after {connect_timeout:?}"),
                )),
            }
        })
    }
}
