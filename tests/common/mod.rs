//! Shared helpers for integration tests: test CAs, a recording upstream and
//! small HTTP clients.

#![allow(dead_code)]

use bytes::Bytes;
use hmac_proxy::auth::{Signer, SigningKey};
use hmac_proxy::proxy::CertificateAuthority;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self as client_http1, SendRequest};
use hyper::header::HeaderMap;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;

pub const KEY_ID: &str = "k1";
pub const SECRET: &str = "s3cr3t";

/// A CA written to disk, usable both as proxy configuration and in-process.
pub struct TestCa {
    pub dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca: CertificateAuthority,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key_pair = rcgen::KeyPair::generate().expect("CA key");
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).expect("CA params");
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, format!("{} test CA", name));
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let cert = params.self_signed(&key_pair).expect("CA certificate");

        let dir = tempfile::tempdir().expect("temp dir");
        let cert_path = dir.path().join(format!("{}-ca.crt", name));
        let key_path = dir.path().join(format!("{}-ca.key", name));
        std::fs::write(&cert_path, cert.pem()).expect("write CA cert");
        std::fs::write(&key_path, key_pair.serialize_pem()).expect("write CA key");

        let ca = CertificateAuthority::from_pem_files(&cert_path, &key_path).expect("load CA");
        Self {
            dir,
            cert_path,
            key_path,
            ca,
        }
    }

    /// Mint a leaf for `host` and write it next to the CA.
    pub fn leaf_files(&self, host: &str) -> (PathBuf, PathBuf) {
        let leaf = self.ca.generate_cert(host).expect("leaf certificate");
        let stem = host.replace([':', '.'], "_");
        let cert = self.dir.path().join(format!("{}.crt", stem));
        let key = self.dir.path().join(format!("{}.key", stem));
        std::fs::write(&cert, leaf.cert_pem).expect("write leaf cert");
        std::fs::write(&key, leaf.key_pem).expect("write leaf key");
        (cert, key)
    }

    /// Client TLS config trusting only this CA.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::builder()
            .with_root_certificates(self.roots())
            .with_no_client_auth()
    }

    /// Client TLS config trusting `self` and presenting a certificate from `client_ca`.
    pub fn client_config_with_cert(&self, client_ca: &TestCa) -> ClientConfig {
        let leaf = client_ca.ca.generate_cert("client.internal").expect("client leaf");
        let certs = rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .expect("client cert");
        let key = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
            .expect("client key")
            .expect("client key present");
        ClientConfig::builder()
            .with_root_certificates(self.roots())
            .with_client_auth_cert(certs, key)
            .expect("client auth config")
    }

    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut self.ca.cert_pem().as_bytes()) {
            roots.add(cert.expect("CA pem")).expect("add root");
        }
        roots
    }
}

/// A request as seen by the upstream.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Plain-HTTP upstream that records requests and echoes method and path.
///
/// `/slow` waits `slow_delay` before answering and signals `slow_started`
/// when it begins.
pub struct EchoUpstream {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
    pub slow_started: Arc<Notify>,
}

impl EchoUpstream {
    pub async fn start(slow_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = listener.local_addr().expect("upstream addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let slow_started = Arc::new(Notify::new());

        let recorded = requests.clone();
        let notify = slow_started.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                let notify = notify.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        let notify = notify.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                            let path = parts
                                .uri
                                .path_and_query()
                                .map(|pq| pq.as_str().to_string())
                                .unwrap_or_default();
                            recorded.lock().unwrap().push(Recorded {
                                method: parts.method.to_string(),
                                path: path.clone(),
                                headers: parts.headers.clone(),
                                body: body.clone(),
                            });
                            if parts.uri.path() == "/slow" {
                                notify.notify_one();
                                tokio::time::sleep(slow_delay).await;
                            }
                            let reply = format!("echo {} {} {}", parts.method, path, body.len());
                            let response = Response::builder()
                                .header("x-upstream", "echo")
                                .body(Full::new(Bytes::from(reply)))
                                .unwrap();
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = server_http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            requests,
            slow_started,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

/// Status, headers and body of a response.
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

pub async fn read_reply(response: Response<Incoming>) -> Reply {
    let (parts, body) = response.into_parts();
    let body = body.collect().await.expect("response body").to_bytes();
    Reply {
        status: parts.status,
        headers: parts.headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

async fn handshake<I>(io: I) -> Result<SendRequest<Full<Bytes>>, hyper::Error>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = client_http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });
    Ok(sender)
}

/// Open a plain HTTP/1.1 connection.
pub async fn connect_plain(addr: SocketAddr) -> SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(addr).await.expect("connect");
    handshake(stream).await.expect("handshake")
}

/// Open an HTTP/1.1 connection over TLS.
pub async fn connect_tls(
    addr: SocketAddr,
    config: ClientConfig,
) -> Result<SendRequest<Full<Bytes>>, Box<dyn std::error::Error + Send + Sync>> {
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::from(addr.ip());
    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await?;
    Ok(handshake(tls).await?)
}

/// CONNECT through `proxy` to `target`, then speak TLS trusting `config`.
pub async fn connect_via_proxy(
    proxy: SocketAddr,
    target: SocketAddr,
    config: ClientConfig,
) -> Result<SendRequest<Full<Bytes>>, Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = TcpStream::connect(proxy).await?;
    let connect = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(connect.as_bytes()).await?;

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err("proxy closed during CONNECT".into());
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    if !head.starts_with("HTTP/1.1 200") {
        return Err(format!("CONNECT refused: {}", head).into());
    }

    let tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::from(target.ip()), stream)
        .await?;
    Ok(handshake(tls).await?)
}

pub fn signer() -> Signer {
    Signer::new(
        SigningKey::new(KEY_ID, SECRET, "", "").expect("key"),
        &["content-type".to_string()],
    )
    .expect("signer")
}

/// Build a request carrying a credential from `signer`.
pub fn signed_request(
    signer: &Signer,
    method: &str,
    path: &str,
    host: &str,
    body: &'static str,
) -> Request<Full<Bytes>> {
    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header("host", host)
        .header("content-type", "text/plain")
        .body(Bytes::from_static(body.as_bytes()))
        .unwrap();
    signer.sign(&mut request).expect("sign");
    request.map(Full::new)
}

/// Build a request without any credential.
pub fn plain_request(method: &str, uri: &str, host: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("host", host)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
