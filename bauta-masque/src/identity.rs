//! Client identity extraction from the presented certificate.

use bauta_core::ClientId;
use rustls::pki_types::CertificateDer;
use x509_parser::prelude::FromDer;

/// Common Name of the leaf certificate a peer presented on this connection.
pub fn client_id_from_connection(connection: &quinn::Connection) -> Option<ClientId> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    let leaf = certs.first()?;
    common_name(leaf.as_ref())
}

/// Parse the subject Common Name out of a DER certificate.
pub fn common_name(der: &[u8]) -> Option<ClientId> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der).ok()?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())?;
    let id = ClientId::new(cn);
    (!id.is_empty()).then_some(id)
}
