//! Test-side peers: the live implementation a script is enacted against.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read exactly `expected.len()` bytes and compare.
///
/// # Errors
///
/// Any I/O error, or `InvalidData` if the bytes differ.
pub async fn expect<S>(io: &mut S, expected: &[u8]) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; expected.len()];
    io.read_exact(&mut buf).await?;
    if buf != expected {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "expected {:?}, got {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&buf)
            ),
        ));
    }
    Ok(())
}

/// Write `bytes` and flush.
///
/// # Errors
///
/// Any I/O error.
pub async fn send<S>(io: &mut S, bytes: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    io.write_all(bytes).await?;
    io.flush().await
}

/// Read until the peer closes.
///
/// # Errors
///
/// Any I/O error.
pub async fn drain<S>(io: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut received = Vec::new();
    io.read_to_end(&mut received).await?;
    Ok(received)
}
