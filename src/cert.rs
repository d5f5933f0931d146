//! Self-signed certificate generation for the SSL upload case.

use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::error::HarnessError;

/// Common name used when the caller has no preference.
pub const DEFAULT_COMMON_NAME: &str = "srs.stack.local";

/// PEM-encoded key and certificate, as the SSL endpoint expects them.
#[derive(Debug, Clone)]
pub struct SelfSignedCert {
    pub key_pem: String,
    pub cert_pem: String,
}

/// Generate an ECDSA P-256 self-signed server certificate valid for 10 years.
pub fn generate_self_signed(common_name: &str) -> Result<SelfSignedCert, HarnessError> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from_slice(&[1]));
    params
        .distinguished_name
        .push(DnType::CommonName, common_name.to_string());
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3652);

    let cert = params.self_signed(&key_pair)?;
    let cert = SelfSignedCert {
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
    };
    debug!(
        cn = %common_name,
        key_bytes = cert.key_pem.len(),
        crt_bytes = cert.cert_pem.len(),
        "created self-signed certificate"
    );
    Ok(cert)
}
