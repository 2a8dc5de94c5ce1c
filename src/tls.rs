use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Certificate and key locations for the wire listener. TLS is off unless both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl TlsSettings {
    /// `ALLOTD_TLS_CERT` and `ALLOTD_TLS_KEY`.
    pub fn from_env() -> Self {
        Self {
            cert_path: std::env::var("ALLOTD_TLS_CERT").ok(),
            key_path: std::env::var("ALLOTD_TLS_KEY").ok(),
        }
    }

    /// Build the acceptor, or `None` when TLS is not configured.
    pub fn acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.cert_path, &self.key_path) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both ALLOTD_TLS_CERT and ALLOTD_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("no certificates found in {cert_path}"),
            ));
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| {
                io::Error::new(ErrorKind::InvalidInput, format!("no private key found in {key_path}"))
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}
