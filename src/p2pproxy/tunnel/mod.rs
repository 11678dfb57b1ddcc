//! Reverse tunnel over a single multiplexed TCP control channel.
//!
//! The server role runs a [`server::P2pServer`] (control channel terminus) and a
//! [`netserver::NetServer`] (public listener). The client role, behind NAT, runs a
//! [`client::P2pClient`] that dials the server and opens one backend connection per
//! relayed public connection. Wire format is described in [`protocol`].

pub mod channel;
pub mod client;
pub mod netserver;
pub mod protocol;
pub mod server;
pub mod session;
pub mod table;

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::watch,
    };

    use super::{
        client::{ClientOptions, P2pClient},
        netserver::{NetServer, NetServerOptions},
        server::{P2pServer, ServerOptions},
    };

    async fn echo_backend() -> std::net::SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut s, _)) = ln.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f()
    }

    #[tokio::test]
    async fn public_connection_reaches_backend_through_tunnel() {
        let backend = echo_backend().await;

        let p2p = P2pServer::new(ServerOptions::default());
        let net = NetServer::new(
            NetServerOptions {
                login_grace: Duration::from_millis(50),
                ..NetServerOptions::default()
            },
            p2p.clone(),
        );
        let p2p_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let net_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let p2p_addr = p2p_ln.local_addr().unwrap();
        let net_addr = net_ln.local_addr().unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn({
            let p2p = p2p.clone();
            let mut rx = stop_rx.clone();
            async move { p2p.serve(p2p_ln, &mut rx).await }
        });
        tokio::spawn({
            let net = net.clone();
            let mut rx = stop_rx.clone();
            async move { net.serve(net_ln, &mut rx).await }
        });

        let client = Arc::new(
            P2pClient::new(ClientOptions {
                control_addr: p2p_addr.to_string(),
                backend_addr: backend.to_string(),
                retry_backoff: Duration::from_millis(100),
                ..ClientOptions::default()
            })
            .unwrap(),
        );
        let backends = client.backends();
        let client_task = tokio::spawn({
            let client = client.clone();
            let rx = stop_rx.clone();
            async move { client.run(rx).await }
        });

        assert!(wait_until(|| p2p.is_connected()).await);

        let mut public = TcpStream::connect(net_addr).await.unwrap();
        assert!(wait_until(|| backends.contains(1)).await);

        let msg = vec![7u8; 10_000];
        public.write_all(&msg).await.unwrap();
        let mut got = vec![0u8; msg.len()];
        tokio::time::timeout(Duration::from_secs(5), public.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);

        drop(public);
        assert!(wait_until(|| !backends.contains(1)).await);
        assert!(wait_until(|| net.client_count() == 0).await);

        // A second connection gets a fresh id.
        let mut again = TcpStream::connect(net_addr).await.unwrap();
        assert!(wait_until(|| backends.contains(2)).await);
        again.write_all(b"hi").await.unwrap();
        let mut two = [0u8; 2];
        again.read_exact(&mut two).await.unwrap();
        assert_eq!(&two, b"hi");

        stop_tx.send(true).unwrap();
        client_task.await.unwrap().unwrap();
        assert!(wait_until(|| backends.is_empty()).await);
    }
}
