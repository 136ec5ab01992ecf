//! TCP bind/connect helpers with retrying logic.

use std::net::SocketAddr;

use crate::utils::ChatError;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Creates a TCP socket for the address family of `addr` with the options
/// every replichat connection uses.
fn new_socket(addr: &SocketAddr) -> Result<TcpSocket, ChatError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
/// Failing to bind after `retries` attempts is returned to the caller.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, ChatError> {
    loop {
        let socket = new_socket(&bind_addr)?;
        let result = socket.bind(bind_addr).and_then(|_| socket.listen(1024));

        match result {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(ChatError::msg(format!(
                        "binding {} failed: {}",
                        bind_addr, err
                    )));
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, ChatError> {
    loop {
        let socket = new_socket(&conn_addr)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(ChatError::msg(format!(
                        "connecting to {} failed: {}",
                        conn_addr, err
                    )));
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_then_connect() -> Result<(), ChatError> {
        let addr: SocketAddr = "127.0.0.1:54700".parse()?;
        let listener = tcp_bind_with_retry(addr, 3).await?;
        let accepting = tokio::spawn(async move { listener.accept().await });
        let stream = tcp_connect_with_retry(addr, 3).await?;
        let (_, peer) = accepting.await??;
        assert_eq!(peer, stream.local_addr()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_gives_up() -> Result<(), ChatError> {
        let addr: SocketAddr = "127.0.0.1:54701".parse()?;
        assert!(tcp_connect_with_retry(addr, 0).await.is_err());
        Ok(())
    }
}
