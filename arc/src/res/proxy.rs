// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.
use crate::models::network::NetProto;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::debug;

/// Userspace forwarder bound on `0.0.0.0:<frontend>`, serving the
/// host-local traffic that the DNAT rule does not catch. Each proxy is an
/// independent task that runs until explicitly closed.
pub struct Proxy {
    task: JoinHandle<()>,
    frontend: u16,
    backend: SocketAddrV4,
}

impl Proxy {
    pub async fn new(
        proto: NetProto,
        frontend: u16,
        backend: SocketAddrV4,
    ) -> std::io::Result<Proxy> {
        match proto {
            NetProto::Tcp => Self::tcp(frontend, backend).await,
            NetProto::Udp => Self::udp(frontend, backend).await,
        }
    }

    async fn tcp(frontend: u16, backend: SocketAddrV4) -> std::io::Result<Proxy> {
        let listener = TcpListener::bind(("0.0.0.0", frontend)).await?;
        let frontend = listener.local_addr()?.port();
        let task = tokio::spawn(async move {
            loop {
                let (mut client, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        debug!("tcp proxy accept failed: {err}");
                        continue;
                    }
                };
                debug!("proxying tcp connection from {peer} to {backend}");
                tokio::spawn(async move {
                    match TcpStream::connect(backend).await {
                        Ok(mut upstream) => {
                            let _ = copy_bidirectional(&mut client, &mut upstream).await;
                        }
                        Err(err) => debug!("cannot reach backend {backend}: {err}"),
                    }
                });
            }
        });
        Ok(Proxy {
            task,
            frontend,
            backend,
        })
    }

    async fn udp(frontend: u16, backend: SocketAddrV4) -> std::io::Result<Proxy> {
        let front = Arc::new(UdpSocket::bind(("0.0.0.0", frontend)).await?);
        let frontend = front.local_addr()?.port();
        let task = tokio::spawn(udp_relay(front, backend));
        Ok(Proxy {
            task,
            frontend,
            backend,
        })
    }

    pub fn frontend(&self) -> u16 {
        self.frontend
    }

    pub fn backend(&self) -> SocketAddrV4 {
        self.backend
    }

    pub fn close(self) {
        self.task.abort();
    }
}

async fn udp_relay(front: Arc<UdpSocket>, backend: SocketAddrV4) {
    let mut clients: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = match front.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                debug!("udp proxy receive failed: {err}");
                break;
            }
        };
        let upstream = match clients.get(&peer) {
            Some(sock) => sock.clone(),
            None => {
                let Ok(sock) = UdpSocket::bind(("0.0.0.0", 0)).await else {
                    continue;
                };
                if sock.connect(backend).await.is_err() {
                    continue;
                }
                let sock = Arc::new(sock);
                clients.insert(peer, sock.clone());
                let reply_front = front.clone();
                let reply_sock = sock.clone();
                // relay backend replies to this client through the frontend
                // socket so the source address matches
                tokio::spawn(async move {
                    let mut rbuf = vec![0u8; 64 * 1024];
                    while let Ok(n) = reply_sock.recv(&mut rbuf).await {
                        if reply_front.send_to(&rbuf[..n], peer).await.is_err() {
                            break;
                        }
                    }
                });
                sock
            }
        };
        let _ = upstream.send(&buf[..len]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_proxy_round_trip() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = match backend.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let proxy = Proxy::new(NetProto::Tcp, 0, backend_addr).await.unwrap();
        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy.frontend()))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        proxy.close();
    }

    #[tokio::test]
    async fn test_udp_proxy_round_trip() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = match backend.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            loop {
                let (n, who) = backend.recv_from(&mut buf).await.unwrap();
                backend.send_to(&buf[..n], who).await.unwrap();
            }
        });

        let proxy = Proxy::new(NetProto::Udp, 0, backend_addr).await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"ping", (Ipv4Addr::LOCALHOST, proxy.frontend()))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        proxy.close();
    }
}
