use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, trace};

use crate::{
    protocol::{AuthMethod, Reply, SocksSocketAddr, CMD_CONNECT, RESERVED, VERSION},
    TransocksError,
};

/// Client side of the SOCKS5 handshake, spoken toward the configured relay.
///
/// Only the "no authentication required" method is offered. After a
/// successful [`Socks5Connector::connect`] the wrapped stream carries raw
/// bytes to and from the requested destination.
pub struct Socks5Connector<'a, T> {
    inner: &'a mut T,
}

impl<'a, T> Socks5Connector<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: &'a mut T) -> Self {
        Self { inner }
    }

    /// Negotiates the method and issues CONNECT for `destination`.
    /// Returns the address the relay reports as bound.
    #[instrument(skip_all, fields(%destination))]
    pub async fn connect(
        &mut self,
        destination: &SocksSocketAddr,
    ) -> crate::Result<SocksSocketAddr> {
        self.negotiate_method().await?;
        self.write_connect(destination).await?;
        let bound = self.read_reply().await?;
        debug!("Relay accepted CONNECT, bound to {}", bound);
        Ok(bound)
    }

    async fn negotiate_method(&mut self) -> crate::Result<()> {
        let greeting = [VERSION, 1, AuthMethod::NoAuthRequired.to_u8()];
        self.inner.write_all(&greeting).await?;
        self.inner.flush().await?;

        let mut answer: [u8; 2] = [0; 2];
        self.inner.read_exact(&mut answer).await?;
        if answer[0] != VERSION {
            return Err(TransocksError::MalformedReply("unexpected version in method selection"));
        }

        match AuthMethod::from_u8(answer[1]) {
            AuthMethod::NoAuthRequired => {
                trace!("Relay selected no authentication");
                Ok(())
            }
            AuthMethod::NoAcceptableMethods => Err(TransocksError::NoAcceptableMethods),
            other => Err(TransocksError::UnsupportedMethod(other)),
        }
    }

    async fn write_connect(&mut self, destination: &SocksSocketAddr) -> crate::Result<()> {
        let addr = destination.to_bytes()?;

        let mut request = Vec::with_capacity(3 + addr.len());
        request.push(VERSION);
        request.push(CMD_CONNECT);
        request.push(RESERVED);
        request.extend_from_slice(&addr);

        self.inner.write_all(&request).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> crate::Result<SocksSocketAddr> {
        let mut header: [u8; 3] = [0; 3];
        self.inner.read_exact(&mut header).await?;
        if header[0] != VERSION {
            return Err(TransocksError::MalformedReply("unexpected version in reply"));
        }

        let reply = Reply::from_u8(header[1])
            .ok_or(TransocksError::MalformedReply("unknown reply code"))?;
        if !reply.is_success() {
            return Err(TransocksError::Socks5Error(reply));
        }

        let bound = SocksSocketAddr::read(&mut *self.inner).await?;
        Ok(bound)
    }
}
