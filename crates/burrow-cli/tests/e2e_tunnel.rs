//! End-to-end tunnel flows over real sockets and TLS.
//!
//! A real server, a real client, a local HTTP echo and a TLS visitor,
//! glued together with a self-signed certificate.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_client::{run_tunnel, ControlClient, Protocol, Service, TunnelContext};
use burrow_proto::credentials;
use burrow_server::{Server, ServerConfig};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn write_cert(dir: &Path) -> (PathBuf, PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "*.localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();

    let cert_path = dir.join("serverCert.pem");
    let key_path = dir.join("serverKey.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

async fn start_server(cert_path: &Path, key_path: &Path) -> (SocketAddr, SocketAddr) {
    let config = ServerConfig {
        control_addr: "127.0.0.1:0".parse().unwrap(),
        public_addr: "127.0.0.1:0".parse().unwrap(),
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
    };

    let server = Server::bind(config).await.unwrap();
    let control_addr = server.control_addr().unwrap();
    let public_addr = server.public_addr().unwrap();
    tokio::spawn(server.run());
    (control_addr, public_addr)
}

/// Minimal HTTP echo: replies `200 hello` to every request.
async fn start_local_http() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                loop {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                    .await;
                let _ = socket.flush().await;
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn register_login_and_tunnel_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (cert_path, key_path) = write_cert(dir.path());
    let (control_addr, public_addr) = start_server(&cert_path, &key_path).await;

    let connector = burrow_tls::build_connector(true);

    // register, then prove the token logs in
    let mut client = ControlClient::connect(&control_addr.to_string(), connector.clone())
        .await
        .unwrap();
    let token = client.register().await.unwrap();
    assert_eq!(token.len(), 44);

    let mut client = client.reconnect().await.unwrap();
    assert!(client.login(&token).await.unwrap());

    let mut client = client.reconnect().await.unwrap();
    assert!(!client.login("not-a-real-token").await.unwrap());
    drop(client);

    // tunnel an HTTP echo under the "demo" subdomain
    let local_addr = start_local_http().await;
    let acceptor = burrow_tls::build_acceptor(&cert_path, &key_path).unwrap();
    let ctx = TunnelContext::new(control_addr.to_string(), connector.clone(), acceptor);
    let traffic = ctx.traffic.clone();
    let service = Service {
        protocol: Protocol::Http,
        local_port: local_addr.port(),
    };

    {
        let ctx = ctx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let _ = run_tunnel(ctx, &token, "demo", service).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // a visitor speaks TLS with SNI demo.localhost at the public port;
    // the handshake is answered inside the client's worker
    let tcp = TcpStream::connect(public_addr).await.unwrap();
    let name = ServerName::try_from("demo.localhost".to_string()).unwrap();
    let mut visitor = connector.connect(name, tcp).await.unwrap();

    visitor
        .write_all(b"GET / HTTP/1.1\r\nHost: demo.localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    visitor.flush().await.unwrap();

    let mut response = Vec::new();
    let _ = visitor.read_to_end(&mut response).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.contains("200 OK"), "unexpected response: {text}");
    assert!(text.contains("hello"), "unexpected response: {text}");

    // the sniffer paired the exchange
    tokio::time::timeout(Duration::from_secs(5), async {
        while traffic.pairs_logged() < 1 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("sniffer never logged the exchange");
    assert_eq!(traffic.pairs_logged(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_live_subdomain_cannot_be_claimed_twice() {
    let dir = tempfile::tempdir().unwrap();
    let (cert_path, key_path) = write_cert(dir.path());
    let (control_addr, _public_addr) = start_server(&cert_path, &key_path).await;

    let connector = burrow_tls::build_connector(true);
    let address = control_addr.to_string();

    let mut client = ControlClient::connect(&address, connector.clone())
        .await
        .unwrap();
    let token = client.register().await.unwrap();
    drop(client);

    // first claim wins
    let mut first = ControlClient::connect(&address, connector.clone())
        .await
        .unwrap();
    assert!(first
        .tunnel(&token, &credentials::generate(), "alpha")
        .await
        .unwrap());

    // second claim on the live subdomain is refused
    let mut second = ControlClient::connect(&address, connector.clone())
        .await
        .unwrap();
    assert!(!second
        .tunnel(&token, &credentials::generate(), "alpha")
        .await
        .unwrap());
    drop(second);

    // closing the first control socket frees the subdomain
    drop(first);
    let reclaimed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut retry = ControlClient::connect(&address, connector.clone())
                .await
                .unwrap();
            if retry
                .tunnel(&token, &credentials::generate(), "alpha")
                .await
                .unwrap()
            {
                break retry;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("subdomain was never released");
    drop(reclaimed);
}
