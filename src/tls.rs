// TLS setup for the tunnel connection
// (c) 2024 Ross Younger

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use quinn::rustls::{self, RootCertStore};
use rustls_pki_types::pem::PemObject as _;
use rustls_pki_types::CertificateDer;
use tracing::warn;

/// Builds the rustls client configuration for the tunnel.
///
/// TLS 1.3 is the floor (QUIC requires it anyway; pinning the version makes
/// the intent explicit). The ALPN token must match the server deployment.
/// `ca_file` adds a custom trust root in PEM form; `insecure` switches off
/// certificate verification entirely, which is only suitable for testing.
pub fn client_config(
    alpn: &str,
    ca_file: Option<&Path>,
    insecure: bool,
) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
    let mut tls = if insecure {
        warn!("TLS certificate verification is DISABLED");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store(ca_file)?)
            .with_no_client_auth()
    };
    tls.alpn_protocols = vec![alpn.as_bytes().to_vec()];
    Ok(tls)
}

/// The trust roots: either the bundled web PKI roots, or solely the
/// operator-supplied CA.
fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            let certs = CertificateDer::pem_file_iter(path)
                .with_context(|| format!("unable to load CA file {}", path.display()))?;
            for cert in certs {
                roots
                    .add(cert.with_context(|| format!("unable to parse CA file {}", path.display()))?)
                    .context("CA certificate rejected")?;
            }
            anyhow::ensure!(
                !roots.is_empty(),
                "CA file {} contained no certificates",
                path.display()
            );
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(roots)
}

mod danger {
    //! A certificate verifier that accepts anything.
    use quinn::rustls;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::DigitallySignedStruct;
    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
    use std::sync::Arc;

    #[derive(Debug)]
    pub(super) struct NoVerification(Arc<CryptoProvider>);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(Arc::new(rustls::crypto::ring::default_provider()))
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alpn_is_set() {
        let tls = client_config("hysteria-proxy", None, false).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"hysteria-proxy".to_vec()]);
    }

    #[test]
    fn insecure_mode_builds() {
        let _ = client_config("hysteria-proxy", None, true).unwrap();
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        assert!(client_config("x", Some(Path::new("/nonexistent/ca.pem")), false).is_err());
    }

    #[test]
    fn custom_ca_loads() -> Result<()> {
        use std::io::Write as _;
        let cert = rcgen::generate_simple_self_signed(["localhost".into()])?;
        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(cert.cert.pem().as_bytes())?;
        let _ = client_config("hysteria-proxy", Some(f.path()), false)?;
        Ok(())
    }
}
