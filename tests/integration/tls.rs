//! Request/reply over `tls://` with a private CA.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};

use switchyard_services::{Discovery, Frame, Gateway, Receiver, ServiceType, Wait};

use crate::{eventually, serve_echo, start_registry, SETTLE};

struct Pki {
    dir: PathBuf,
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl Drop for Pki {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// A CA and a leaf for `localhost` / 127.0.0.1 signed by it, written as PEM.
fn write_pki(label: &str) -> Result<Pki> {
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "switchyard test ca");
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()])?;
    leaf_params
        .subject_alt_names
        .push(SanType::IpAddress("127.0.0.1".parse::<IpAddr>()?));
    let leaf_key = KeyPair::generate()?;
    let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

    let dir = std::env::temp_dir().join(format!(
        "switchyard-tls-{label}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir)?;
    let pki = Pki {
        ca: dir.join("ca.pem"),
        cert: dir.join("cert.pem"),
        key: dir.join("key.pem"),
        dir,
    };
    std::fs::write(&pki.ca, ca_cert.pem())?;
    std::fs::write(&pki.cert, leaf.pem())?;
    std::fs::write(&pki.key, leaf_key.serialize_pem())?;
    Ok(pki)
}

#[tokio::test]
async fn request_reply_over_tls() -> Result<()> {
    let pki = write_pki("round-trip")?;
    let (registry, bcast, req) = start_registry(None).await?;

    let receiver = Arc::new(Receiver::new());
    receiver.set_tls_server(&pki.cert, &pki.key)?;
    let bound = receiver.bind("tls://127.0.0.1:0").await?;
    assert!(bound.starts_with("tls://127.0.0.1:"));
    receiver.connect_registry(&req)?;
    receiver.register("secure", "", 1).await?.wait(SETTLE).await?;
    serve_echo(receiver.clone(), "tls");

    let discovery = Arc::new(Discovery::new(ServiceType::Gateway));
    discovery.connect_registry(&bcast)?;
    let gateway = Arc::new(Gateway::new(discovery.clone()));
    gateway.set_tls_client(Some(&pki.ca), Some("localhost"), false)?;
    eventually("tls connection", || {
        let g = gateway.clone();
        async move { g.connection_count("secure").unwrap_or(0) == 1 }
    })
    .await?;

    gateway
        .send("secure", vec![Frame::from("ping")], Wait::Block)
        .await?;
    let (service, reply) = gateway.recv(Wait::Timeout(SETTLE)).await?;
    assert_eq!(service, "secure");
    assert_eq!(reply, vec![Frame::from("tls"), Frame::from("ping")]);

    gateway.close();
    receiver.close();
    registry.close();
    Ok(())
}
