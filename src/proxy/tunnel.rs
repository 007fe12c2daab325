//! Bidirectional byte splicing for CONNECT tunnels

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::Result;

/// Copy bytes in both directions until either side closes
///
/// Each write half is shut down once its source reaches EOF, so the tunnel
/// drains cleanly instead of hanging on one dead leg. Returns
/// (client→server, server→client) byte counts.
pub async fn splice<C, S>(mut client: C, mut server: S) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (bytes_sent, bytes_received) =
        tokio::io::copy_bidirectional(&mut client, &mut server).await?;

    debug!(bytes_sent, bytes_received, "tunnel closed");

    Ok((bytes_sent, bytes_received))
}
