//! Outbound "new commit" ping to the peer's trigger listener.

use std::time::Duration;

use async_trait::async_trait;

use tandem_core::ResolvedPeer;

use crate::error::DaemonError;

#[async_trait]
pub trait PeerNotifier: Send + Sync {
    /// Tell `peer` a new local revision exists. The response body is ignored.
    async fn notify(&self, peer: &ResolvedPeer) -> Result<(), DaemonError>;
}

/// `GET http://<peer-host>:<port>/`, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    port: u16,
    timeout: Duration,
}

impl HttpNotifier {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    pub fn url_for(&self, peer: &ResolvedPeer) -> String {
        format!("http://{}:{}/", peer.bracketed_host(), self.port)
    }
}

#[async_trait]
impl PeerNotifier for HttpNotifier {
    async fn notify(&self, peer: &ResolvedPeer) -> Result<(), DaemonError> {
        let url = self.url_for(peer);
        let timeout = self.timeout;
        let target = url.clone();
        tokio::task::spawn_blocking(move || {
            let agent = ureq::AgentBuilder::new().timeout(timeout).build();
            agent
                .get(&target)
                .call()
                .map(|_| ())
                .map_err(|err| DaemonError::Protocol(format!("notify {target} failed: {err}")))
        })
        .await
        .map_err(|err| DaemonError::Protocol(format!("notify task join error: {err}")))??;
        tracing::debug!(url = %url, "peer notified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(host: &str) -> ResolvedPeer {
        ResolvedPeer {
            user: None,
            host: host.to_string(),
            folder: "/srv/notes".to_string(),
        }
    }

    #[test]
    fn url_uses_host_and_port() {
        let notifier = HttpNotifier::new(3294, Duration::from_secs(1));
        assert_eq!(notifier.url_for(&peer("box.lan")), "http://box.lan:3294/");
    }

    #[test]
    fn url_brackets_ipv6() {
        let notifier = HttpNotifier::new(3294, Duration::from_secs(1));
        assert_eq!(notifier.url_for(&peer("fe80::1")), "http://[fe80::1]:3294/");
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let notifier = HttpNotifier::new(port, Duration::from_millis(500));
        let err = notifier
            .notify(&peer("127.0.0.1"))
            .await
            .expect_err("nothing is listening");
        assert!(err.to_string().contains("notify"));
    }
}
