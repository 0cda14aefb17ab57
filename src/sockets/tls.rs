//! TLS client layered over an IP stream socket.
//!
//! The rustls `ClientConnection` is the TLS state machine: the delegate
//! feeds it ciphertext received from the socket and plaintext supplied by
//! the caller, and ships whatever ciphertext it produces back out through
//! the plain bidirectional delegate. Alerts and the peer's close_notify
//! ride in the `RecvResult` success payload, never in the error channel.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, OnceLock};

use rustls::pki_types::ServerName;
use rustls::{AlertDescription, CertificateError, ClientConfig, ClientConnection, RootCertStore};

use crate::device::Device;
use crate::error::{Error, Result, TlsError};
use crate::sockets::delegates::{bidirectional, client};
use crate::sockets::handle::{Ip, SocketHandle};
use crate::sockets::{RecvResult, TlsAlert};

/// Ciphertext chunk size used while driving the handshake and reads.
const RECORD_CHUNK: usize = 1024;

pub(crate) struct TlsState {
    conn: Option<ClientConnection>,
    /// Decrypted bytes not yet handed to the caller.
    plaintext: Vec<u8>,
    /// Alert received mid-handshake, surfaced by the first recv.
    deferred_alert: Option<TlsAlert>,
    /// The peer sent close_notify; buffered plaintext still drains first.
    peer_closed: bool,
    /// The close_notify alert has been handed to the caller; subsequent
    /// reads report closure.
    close_alerted: bool,
}

impl TlsState {
    pub(crate) fn new() -> TlsState {
        TlsState {
            conn: None,
            plaintext: Vec::new(),
            deferred_alert: None,
            peer_closed: false,
            close_alerted: false,
        }
    }

    /// Opens the TCP connection and drives the TLS handshake to an active
    /// session.
    ///
    /// Certificate validation failures surface here as [`TlsError`]. A
    /// fatal alert sent by the peer instead aborts the handshake quietly
    /// and is delivered by the first `recv`, mirroring how the session
    /// would behave had the alert raced the first application read.
    pub(crate) async fn connect(
        &mut self,
        handle: &mut SocketHandle<Ip>,
        device: &Device,
    ) -> Result<()> {
        client::connect_ip(handle, device).await?;

        let server_name = ServerName::try_from(device.address.clone())
            .map_err(|_| TlsError(format!("Invalid server name: {}", device.address)))?;
        let mut conn = ClientConnection::new(tls_config()?, server_name).map_err(map_tls_error)?;

        while conn.is_handshaking() {
            flush(&mut conn, handle).await?;
            if !conn.is_handshaking() {
                break;
            }

            let chunk = bidirectional::recv(handle.raw(), handle.home(), RECORD_CHUNK).await?;
            if chunk.closed {
                return Err(TlsError("Peer closed during handshake".into()).into());
            }

            let mut cursor = &chunk.data[..];
            while !cursor.is_empty() {
                match conn.read_tls(&mut cursor) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => return Err(TlsError(e.to_string()).into()),
                }
            }

            match conn.process_new_packets() {
                Ok(_) => {}
                Err(rustls::Error::AlertReceived(desc)) => {
                    self.deferred_alert = Some(TlsAlert {
                        desc: alert_name(desc),
                        is_fatal: true,
                    });
                    break;
                }
                Err(e) => return Err(map_tls_error(e)),
            }
        }

        // Flush the final handshake flight (or our alert response).
        flush(&mut conn, handle).await?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Encrypts and sends; the state machine may produce several records.
    pub(crate) async fn send(&mut self, handle: &SocketHandle<Ip>, data: &[u8]) -> Result<()> {
        let conn = self.session()?;
        conn.writer()
            .write_all(data)
            .map_err(|e| Error::from(TlsError(e.to_string())))?;
        flush(self.session()?, handle).await
    }

    /// Returns buffered plaintext, or reads ciphertext and runs it through
    /// the state machine until it yields plaintext, an alert, or closure.
    pub(crate) async fn recv(&mut self, handle: &SocketHandle<Ip>, size: usize) -> Result<RecvResult> {
        if let Some(alert) = self.deferred_alert.take() {
            return Ok(RecvResult {
                complete: true,
                closed: false,
                data: Vec::new(),
                alert: Some(alert),
            });
        }

        loop {
            if !self.plaintext.is_empty() {
                let data = std::mem::take(&mut self.plaintext);
                return Ok(RecvResult {
                    complete: true,
                    closed: false,
                    data,
                    alert: None,
                });
            }

            if self.peer_closed {
                // Orderly TLS closure: surface close_notify once after the
                // plaintext drained, then report the session closed.
                if !self.close_alerted {
                    self.close_alerted = true;
                    return Ok(RecvResult {
                        complete: true,
                        closed: false,
                        data: Vec::new(),
                        alert: Some(TlsAlert {
                            desc: alert_name(AlertDescription::CloseNotify),
                            is_fatal: false,
                        }),
                    });
                }
                return Ok(RecvResult {
                    complete: true,
                    closed: true,
                    data: Vec::new(),
                    alert: None,
                });
            }

            // Nothing buffered; pull more ciphertext off the wire.
            if self.conn.is_none() {
                return Err(TlsError("TLS session is not active".into()).into());
            }
            let chunk =
                bidirectional::recv(handle.raw(), handle.home(), size.max(RECORD_CHUNK)).await?;
            let conn = self.conn.as_mut().expect("session checked above");

            if chunk.closed {
                return Ok(RecvResult {
                    complete: true,
                    closed: true,
                    data: Vec::new(),
                    alert: None,
                });
            }

            let mut cursor = &chunk.data[..];
            while !cursor.is_empty() {
                match conn.read_tls(&mut cursor) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => return Err(TlsError(e.to_string()).into()),
                }
            }

            let state = match conn.process_new_packets() {
                Ok(state) => state,
                Err(rustls::Error::AlertReceived(desc)) => {
                    return Ok(RecvResult {
                        complete: true,
                        closed: false,
                        data: Vec::new(),
                        alert: Some(TlsAlert {
                            desc: alert_name(desc),
                            is_fatal: true,
                        }),
                    });
                }
                Err(e) => return Err(map_tls_error(e)),
            };

            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let start = self.plaintext.len();
                self.plaintext.resize(start + pending, 0);
                let mut reader = conn.reader();
                let mut filled = 0;
                while filled < pending {
                    match std::io::Read::read(&mut reader, &mut self.plaintext[start + filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) => return Err(TlsError(e.to_string()).into()),
                    }
                }
                self.plaintext.truncate(start + filled);
            }

            if state.peer_has_closed() {
                self.peer_closed = true;
            }
        }
    }

    fn session(&mut self) -> Result<&mut ClientConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| TlsError("TLS session is not active".into()).into())
    }
}

impl fmt::Debug for TlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsState")
            .field("active", &self.conn.is_some())
            .field("buffered", &self.plaintext.len())
            .finish()
    }
}

/// Ships every ciphertext record the state machine wants written.
async fn flush(conn: &mut ClientConnection, handle: &SocketHandle<Ip>) -> Result<()> {
    while conn.wants_write() {
        let mut record = Vec::new();
        conn.write_tls(&mut record)
            .map_err(|e| Error::from(TlsError(e.to_string())))?;
        if record.is_empty() {
            break;
        }
        bidirectional::send(handle.raw(), handle.home(), record).await?;
    }
    Ok(())
}

/// Client config validating strictly against the system trust store.
fn tls_config() -> Result<Arc<ClientConfig>> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err(TlsError("No trusted root certificates available".into()).into());
    }

    let config = Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    Ok(CONFIG.get_or_init(|| config).clone())
}

fn map_tls_error(e: rustls::Error) -> Error {
    let msg = match &e {
        rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer) => {
            "Certificate validation failure: Cannot establish trust".into()
        }
        rustls::Error::InvalidCertificate(
            CertificateError::Expired | CertificateError::ExpiredContext { .. },
        ) => "Certificate validation failure: Certificate has expired".into(),
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. },
        ) => "Certificate validation failure: Certificate is not yet valid".into(),
        rustls::Error::InvalidCertificate(other) => {
            format!("Certificate validation failure: {other:?}")
        }
        other => other.to_string(),
    };
    TlsError(msg).into()
}

/// The standard (IANA registry) name of an alert.
fn alert_name(desc: AlertDescription) -> String {
    use AlertDescription::*;
    let name = match desc {
        CloseNotify => "close_notify",
        UnexpectedMessage => "unexpected_message",
        BadRecordMac => "bad_record_mac",
        DecryptionFailed => "decryption_failed",
        RecordOverflow => "record_overflow",
        DecompressionFailure => "decompression_failure",
        HandshakeFailure => "handshake_failure",
        NoCertificate => "no_certificate",
        BadCertificate => "bad_certificate",
        UnsupportedCertificate => "unsupported_certificate",
        CertificateRevoked => "certificate_revoked",
        CertificateExpired => "certificate_expired",
        CertificateUnknown => "certificate_unknown",
        IllegalParameter => "illegal_parameter",
        UnknownCA => "unknown_ca",
        AccessDenied => "access_denied",
        DecodeError => "decode_error",
        DecryptError => "decrypt_error",
        ExportRestriction => "export_restriction",
        ProtocolVersion => "protocol_version",
        InsufficientSecurity => "insufficient_security",
        InternalError => "internal_error",
        InappropriateFallback => "inappropriate_fallback",
        UserCanceled => "user_canceled",
        NoRenegotiation => "no_renegotiation",
        MissingExtension => "missing_extension",
        UnsupportedExtension => "unsupported_extension",
        CertificateUnobtainable => "certificate_unobtainable",
        UnrecognisedName => "unrecognized_name",
        BadCertificateStatusResponse => "bad_certificate_status_response",
        BadCertificateHashValue => "bad_certificate_hash_value",
        UnknownPSKIdentity => "unknown_psk_identity",
        CertificateRequired => "certificate_required",
        NoApplicationProtocol => "no_application_protocol",
        other => return format!("unknown_alert_{}", u8::from(other)),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_names_use_registry_form() {
        assert_eq!(alert_name(AlertDescription::CloseNotify), "close_notify");
        assert_eq!(
            alert_name(AlertDescription::HandshakeFailure),
            "handshake_failure"
        );
        assert_eq!(alert_name(AlertDescription::UnknownCA), "unknown_ca");
    }

    #[test]
    fn certificate_errors_map_to_stable_messages() {
        let trust = map_tls_error(rustls::Error::InvalidCertificate(
            CertificateError::UnknownIssuer,
        ));
        assert_eq!(
            trust.to_string(),
            "Certificate validation failure: Cannot establish trust"
        );

        let expired = map_tls_error(rustls::Error::InvalidCertificate(CertificateError::Expired));
        assert_eq!(
            expired.to_string(),
            "Certificate validation failure: Certificate has expired"
        );
    }
}
