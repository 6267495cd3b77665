//! Selector metadata for keys being added.

use ssh_agent_lib::proto::{AddIdentity, Credential};
use ssh_key::HashAlg;
use ssh_key::public::KeyData;
use sshmux_core::KeyInfo;

/// Derive comment, key type and SHA-256 fingerprint from the key material
/// supplied with an add request.
///
/// Type and fingerprint fall back to `"unknown"` when no public key can be
/// derived from the private half.
pub fn key_info(identity: &AddIdentity) -> KeyInfo {
    match &identity.credential {
        Credential::Key { privkey, comment } => match KeyData::try_from(privkey) {
            Ok(public) => describe(&public, comment),
            Err(_) => KeyInfo::unknown(comment.clone()),
        },
        Credential::Cert {
            certificate,
            comment,
            ..
        } => describe(certificate.public_key(), comment),
    }
}

fn describe(public: &KeyData, comment: &str) -> KeyInfo {
    KeyInfo {
        comment: comment.to_string(),
        key_type: public.algorithm().as_str().to_string(),
        fingerprint: public.fingerprint(HashAlg::Sha256).to_string(),
    }
}
