//! End-to-end CONNECT-IP negotiation over a real QUIC connection with a
//! generated operator CA and mutual authentication.

use bauta_core::config::{ClientConfig, ServerConfig};
use bauta_masque::connect::{ConnectResponse, SessionGrant};
use bauta_masque::{client, identity, server};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::net::SocketAddr;
use std::path::PathBuf;

struct TestPki {
    dir: tempfile::TempDir,
}

impl TestPki {
    fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "bauta test ca");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        std::fs::write(dir.path().join("ca.pem"), ca_cert.pem()).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".into()]).unwrap();
        server_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();
        std::fs::write(dir.path().join("server.pem"), server_cert.pem()).unwrap();
        std::fs::write(dir.path().join("server.key"), server_key.serialize_pem()).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::new()).unwrap();
        client_params
            .distinguished_name
            .push(DnType::CommonName, "client-1");
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();
        std::fs::write(dir.path().join("client.pem"), client_cert.pem()).unwrap();
        std::fs::write(dir.path().join("client.key"), client_key.serialize_pem()).unwrap();

        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn server_config(pki: &TestPki) -> ServerConfig {
    let toml_src = format!(
        r#"
        listen_addr = "127.0.0.1:0"
        assign_cidr = "10.8.0.0/24"
        advertise_routes = ["0.0.0.0/0"]
        ca_file = {ca:?}
        tls_cert = {cert:?}
        tls_key = {key:?}
        "#,
        ca = pki.path("ca.pem"),
        cert = pki.path("server.pem"),
        key = pki.path("server.key"),
    );
    toml::from_str(&toml_src).unwrap()
}

fn client_config(pki: &TestPki, server_addr: SocketAddr) -> ClientConfig {
    let toml_src = format!(
        r#"
        server_addr = "{server_addr}"
        server_name = "localhost"
        ca_file = {ca:?}
        tls_cert = {cert:?}
        tls_key = {key:?}
        "#,
        ca = pki.path("ca.pem"),
        cert = pki.path("client.pem"),
        key = pki.path("client.key"),
    );
    toml::from_str(&toml_src).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn negotiate_end_to_end() {
    let pki = TestPki::generate();
    let server_cfg = server_config(&pki);

    let endpoint = server::server_endpoint(&server_cfg).unwrap();
    let server_addr = endpoint.local_addr().unwrap();

    let grant = SessionGrant {
        assigned: "10.8.0.2/32".parse().unwrap(),
        gateway: "10.8.0.1".parse().unwrap(),
        routes: vec!["0.0.0.0/0".parse().unwrap()],
    };

    let expect = grant.clone();
    let server_task = tokio::spawn(async move {
        let incoming = endpoint.accept().await.unwrap();
        let connection = incoming.await.unwrap();

        let client_id = identity::client_id_from_connection(&connection).unwrap();
        assert_eq!(client_id.as_str(), "client-1");

        let (mut send, mut recv) = connection.accept_bi().await.unwrap();
        let request = server::read_connect(&mut recv).await.unwrap();
        server::validate(&request).unwrap();
        server::respond(&mut send, ConnectResponse::Ok).await.unwrap();
        server::send_grant(&mut send, &expect).await.unwrap();

        // Hold the connection open until the client has read everything.
        let _ = recv.read_to_end(64).await;
        endpoint.wait_idle().await;
    });

    let client_cfg = client_config(&pki, server_addr);
    let session = client::establish(&client_cfg).await.unwrap();
    assert_eq!(session.grant, grant);

    session.connection.close(0u32.into(), b"done");
    server_task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejection_propagates_as_protocol_error() {
    let pki = TestPki::generate();
    let server_cfg = server_config(&pki);

    let endpoint = server::server_endpoint(&server_cfg).unwrap();
    let server_addr = endpoint.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let incoming = endpoint.accept().await.unwrap();
        let connection = incoming.await.unwrap();
        let (mut send, mut recv) = connection.accept_bi().await.unwrap();
        let _ = server::read_connect(&mut recv).await.unwrap();
        server::respond(&mut send, ConnectResponse::PoolExhausted)
            .await
            .unwrap();
        let _ = send.finish();
        endpoint.wait_idle().await;
    });

    let client_cfg = client_config(&pki, server_addr);
    let err = client::establish(&client_cfg).await.unwrap_err();
    assert!(matches!(err, bauta_core::Error::Protocol(_)), "{err}");
    server_task.await.unwrap();
}
