use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{self, CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsConnector, client::TlsStream, rustls};
use tokio_util::codec;
use tokio_util::codec::Framed;

use crate::invalid_cert_verifier::InvalidServerCertVerifier;

pub enum Connection<Codec> {
    Tls(Framed<TlsStream<TcpStream>, Codec>),
    Unsecured(Framed<TcpStream, Codec>),
}

#[derive(Debug, Clone)]
pub enum Security<'a> {
    Unsecured,
    Secured {
        accept_invalid_certs: bool,
        root_cert_path: Option<&'a PathBuf>,
        client_cert_path: Option<&'a PathBuf>,
        client_key_path: Option<&'a PathBuf>,
    },
}

#[derive(Debug, Clone)]
pub struct Config<'a> {
    pub server: &'a str,
    pub port: u16,
    pub security: Security<'a>,
}

impl<Codec> Connection<Codec> {
    /// Opens an outgoing connection to an IRC server.
    pub async fn new(config: Config<'_>, codec: Codec) -> Result<Self, Error> {
        let tcp = TcpStream::connect((config.server, config.port)).await?;

        if let Security::Secured {
            accept_invalid_certs,
            root_cert_path,
            client_cert_path,
            client_key_path,
        } = config.security
        {
            let mut roots = rustls::RootCertStore::empty();

            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                log::warn!("failed to load platform certificate: {error}");
            }
            roots.add_parsable_certificates(native.certs);

            if let Some(root_cert_path) = root_cert_path {
                roots.add_parsable_certificates(read_certs_from_path(root_cert_path).await?);
            }

            let builder = rustls::ClientConfig::builder();
            let builder = if accept_invalid_certs {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(InvalidServerCertVerifier::new(
                        roots,
                    )?))
            } else {
                builder.with_root_certificates(roots)
            };

            let client_config = match (client_cert_path, client_key_path) {
                (None, None) => builder.with_no_client_auth(),
                (Some(cert_path), None) => {
                    let (certs, key) = read_certs_and_key_from_path(cert_path).await?;
                    builder.with_client_auth_cert(certs, key)?
                }
                (Some(cert_path), Some(key_path)) if cert_path == key_path => {
                    let (certs, key) = read_certs_and_key_from_path(cert_path).await?;
                    builder.with_client_auth_cert(certs, key)?
                }
                (Some(cert_path), Some(key_path)) => builder.with_client_auth_cert(
                    read_certs_from_path(cert_path).await?,
                    read_key_from_path(key_path).await?,
                )?,
                (None, Some(_)) => {
                    return Err(Error::ClientCertificate(CertificateError::BadCertificateFile));
                }
            };

            let server_name = pki_types::ServerName::try_from(config.server.to_owned())
                .map_err(|_| Error::InvalidServerName(config.server.to_owned()))?;
            let tls = TlsConnector::from(Arc::new(client_config));
            let tls = tls.connect(server_name, tcp).await?;

            Ok(Self::Tls(Framed::new(tls, codec)))
        } else {
            Ok(Self::Unsecured(Framed::new(tcp, codec)))
        }
    }

    /// Wraps a socket accepted by a listener.
    pub fn accept(tcp: TcpStream, codec: Codec) -> Self {
        Self::Unsecured(Framed::new(tcp, codec))
    }

    pub async fn shutdown(self) -> Result<(), Error> {
        match self {
            Connection::Tls(framed) => {
                framed.into_inner().shutdown().await?;
            }
            Connection::Unsecured(framed) => {
                framed.into_inner().shutdown().await?;
            }
        }
        Ok(())
    }
}

async fn read_certs_and_key_from_path<P: AsRef<Path>>(
    path: P,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let pem_bytes = fs::read(path).await?;
    let mut pem_reader = Cursor::new(pem_bytes);

    let certs = rustls_pemfile::certs(&mut pem_reader).collect::<Result<Vec<_>, _>>()?;

    pem_reader.set_position(0);

    let key = rustls_pemfile::private_key(&mut pem_reader)?
        .ok_or(Error::ClientCertificate(CertificateError::BadPrivateKey))?;

    Ok((certs, key))
}

async fn read_certs_from_path<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<CertificateDer<'static>>, Error> {
    let pem_bytes = fs::read(path).await?;
    let mut pem_reader = Cursor::new(pem_bytes);

    let certs = rustls_pemfile::certs(&mut pem_reader).collect::<Result<Vec<_>, _>>()?;

    Ok(certs)
}

async fn read_key_from_path<P: AsRef<Path>>(path: P) -> Result<PrivateKeyDer<'static>, Error> {
    let pem_bytes = fs::read(path).await?;
    let mut pem_reader = Cursor::new(pem_bytes);

    let key = rustls_pemfile::private_key(&mut pem_reader)?
        .ok_or(Error::ClientCertificate(CertificateError::BadPrivateKey))?;

    Ok(key)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate verifier error: {0}")]
    Verifier(#[from] rustls::client::VerifierBuilderError),
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("client certificate error: {0}")]
    ClientCertificate(CertificateError),
}

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("missing or invalid private key")]
    BadPrivateKey,
    #[error("missing or invalid certificate file")]
    BadCertificateFile,
}

macro_rules! delegate {
    ($e:expr, $($t:tt)*) => {
        match $e {
            $crate::connection::Connection::Tls(framed) => framed.$($t)*,
            $crate::connection::Connection::Unsecured(framed) => framed.$($t)*,
        }
    };
}

impl<Codec> Stream for Connection<Codec>
where
    Codec: codec::Decoder,
{
    type Item = Result<Codec::Item, Codec::Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        delegate!(self.get_mut(), poll_next_unpin(cx))
    }
}

impl<Item, Codec> Sink<Item> for Connection<Codec>
where
    Codec: codec::Encoder<Item>,
{
    type Error = Codec::Error;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        delegate!(self.get_mut(), poll_ready_unpin(cx))
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Item) -> Result<(), Self::Error> {
        delegate!(self.get_mut(), start_send_unpin(item))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        delegate!(self.get_mut(), poll_flush_unpin(cx))
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        delegate!(self.get_mut(), poll_close_unpin(cx))
    }
}
