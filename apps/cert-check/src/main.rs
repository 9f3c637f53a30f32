//! Reproduces the "certificate checker" tool: connects to a domain over
//! TLS, inspects the leaf certificate's expiry, and reports whether it is
//! still valid for at least `--limit` more days.
//!
//! Full certificate-chain inspection is out of scope here; this tool is a
//! thin, standalone consumer that only reads the leaf certificate's
//! `notAfter` field, trusting nothing about the chain beyond that it
//! parses.
use std::io::ErrorKind;
use std::net::TcpStream;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, SignatureScheme};
use tracing::error;

/// Check how many days remain before a domain's TLS certificate expires.
#[derive(Parser, Debug)]
#[command(name = "cert-check", version)]
struct Args {
    /// Minimum number of days until expiry required to pass.
    #[arg(long)]
    limit: i64,

    /// Domain to connect to, optionally `domain:port` (default port 443).
    domain: String,
}

/// Accepts any certificate chain without validating it: this tool only
/// wants to read the leaf certificate's own `notAfter` field, not confirm
/// the chain is trusted.
#[derive(Debug)]
struct AcceptAny(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for AcceptAny {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
        .map(|_| HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
        .map(|_| HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }

    fn requires_raw_public_keys(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> Option<&[rustls::DistinguishedName]> {
        None
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("warn").init();
    let args = Args::parse();

    match check(&args) {
        Ok(days_remaining) if days_remaining >= args.limit => ExitCode::SUCCESS,
        Ok(days_remaining) => {
            error!(
                "{} expires in {days_remaining} day(s), below the required {}",
                args.domain, args.limit
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}: {e}", args.domain);
            ExitCode::FAILURE
        }
    }
}

fn check(args: &Args) -> Result<i64, String> {
    let (host, port) = match args.domain.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| format!("invalid port `{port}`"))?,
        ),
        None => (args.domain.as_str(), 443),
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("tls config: {e}"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny(provider)))
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| format!("`{host}` is not a valid server name"))?;
    let mut conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| format!("tls session init: {e}"))?;
    let mut sock = TcpStream::connect((host, port)).map_err(|e| format!("connect: {e}"))?;
    sock.set_read_timeout(Some(Duration::from_secs(10))).ok();

    while conn.is_handshaking() {
        match conn.complete_io(&mut sock) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(format!("handshake: {e}")),
        }
    }

    let leaf = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| "server presented no certificate".to_string())?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| format!("certificate parse: {e}"))?;
    let not_after = cert.validity().not_after.timestamp();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("clock: {e}"))?
        .as_secs() as i64;

    Ok((not_after - now) / 86_400)
}
