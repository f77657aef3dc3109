use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// How long a probe keeps retrying after its first local exhaustion error.
const MAX_EXHAUSTION_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

/// Errors raised by the local stack when it runs out of sockets or ephemeral ports.
/// They say nothing about the remote port.
fn is_local_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        // EMFILE ENFILE EADDRINUSE(linux/mac) EADDRNOTAVAIL(linux/mac) ENOBUFS(linux)
        Some(24 | 23 | 98 | 48 | 99 | 49 | 105)
        // WSAEMFILE WSAEADDRINUSE WSAEADDRNOTAVAIL WSAENOBUFS
            | Some(10024 | 10048 | 10049 | 10055)
    )
}

/// Calls `connect` until it returns something other than a local exhaustion error.
///
/// Exhaustion normally cannot happen because sockets are handed out through the
/// scanner's socket budget; other processes can still eat descriptors though.
async fn retry_on_exhaustion<T, F, Fut>(mut connect: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut first_exhaustion: Option<Instant> = None;
    let mut backoff = 20;

    loop {
        match connect().await {
            Err(e) if is_local_exhaustion(&e) => {
                let since = *first_exhaustion.get_or_insert_with(Instant::now);
                if since.elapsed() > MAX_EXHAUSTION_WAIT {
                    return Err(e);
                }
                if matches!(e.raw_os_error(), Some(98 | 48 | 10048)) {
                    // ephemeral ports exhausted, TIME_WAIT needs to drain
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    backoff = (backoff * 2).min(2000);
                } else {
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(1000);
                }
            }
            other => return other,
        }
    }
}

/// Probes one TCP port. A completed handshake means open, an RST means closed,
/// silence (or any other failure) means filtered.
///
/// The caller must already hold a socket permit: `connect_timeout` covers the
/// handshake only.
pub async fn probe_port(addr: SocketAddr, connect_timeout: Duration) -> PortState {
    // spread the first wave so thousands of SYNs do not leave at once
    let jitter = rand::random::<u64>() % 50;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let result = retry_on_exhaustion(|| async move {
        timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))?
    })
    .await;

    match result {
        Ok(stream) => {
            drop(stream);
            PortState::Open
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => PortState::Closed,
        Err(e) => {
            if is_local_exhaustion(&e) {
                debug!("{} gave up waiting for a local socket: {}", addr, e);
            }
            PortState::Filtered
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// A listener whose accept queue is full: further SYNs are dropped, so
    /// connecting to it hangs until the timeout. The returned clients keep the
    /// queue occupied and must stay alive for as long as the address is used.
    #[cfg(target_os = "linux")]
    pub(crate) async fn saturated_listener() -> (TcpListener, Vec<TcpStream>, SocketAddr) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut fillers = Vec::new();
        for _ in 0..4 {
            if let Ok(Ok(s)) = timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                fillers.push(s);
            }
        }
        (listener, fillers, addr)
    }

    #[tokio::test]
    async fn test_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = probe_port(addr, Duration::from_millis(1000)).await;
        assert_eq!(state, PortState::Open);
    }

    #[tokio::test]
    async fn test_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let state = probe_port(addr, Duration::from_millis(1000)).await;
        assert_eq!(state, PortState::Closed);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_silent_port_is_filtered() {
        let (_listener, _fillers, addr) = saturated_listener().await;
        let start = Instant::now();
        let state = probe_port(addr, Duration::from_millis(300)).await;
        assert_eq!(state, PortState::Filtered);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_retried() {
        let calls = AtomicUsize::new(0);
        let result = retry_on_exhaustion(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(io::Error::from_raw_os_error(24))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_gives_up_eventually() {
        let result: io::Result<()> =
            retry_on_exhaustion(|| async { Err(io::Error::from_raw_os_error(24)) }).await;
        assert_eq!(result.unwrap_err().raw_os_error(), Some(24));
    }

    #[tokio::test]
    async fn test_refused_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: io::Result<()> = retry_on_exhaustion(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::from(io::ErrorKind::ConnectionRefused)) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhaustion_codes() {
        assert!(is_local_exhaustion(&io::Error::from_raw_os_error(24)));
        assert!(is_local_exhaustion(&io::Error::from_raw_os_error(10048)));
        assert!(!is_local_exhaustion(&io::Error::from_raw_os_error(111)));
        assert!(!is_local_exhaustion(&io::Error::new(io::ErrorKind::TimedOut, "t")));
    }
}
