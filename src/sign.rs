//! Detached-signature generation and application (spec §4.4).
//!
//! Canonical byte assembly mirrors the original signer's `sign()`/`unsign()`
//! methods exactly: a fixed concatenation order, independent of INFO parsing,
//! so the signed digest covers the bytes a client will actually download.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use openpgp::cert::{Cert, CertBuilder};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Message, Signer};
use openpgp::serialize::SerializeInto;
use openpgp::types::KeyFlags;
use sailfish::TemplateSimple;
use secrecy::SecretSlice;
use sequoia_openpgp as openpgp;
use tar::{Builder, Header};

use crate::errors::IoError;

const CERT_LIFETIME: u64 = 2 * 31_556_952; // ~2 years
pub const SIGNATURE_FILENAME: &str = "syno_signature.asc";
const TIMESTAMP_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct GeneratedCert {
    pub id: String,
    pub pubkey: SecretSlice<u8>,
    pub privkey: SecretSlice<u8>,
    pub expiry: u64,
}

#[derive(TemplateSimple)]
#[template(path = "gen-key-instructions.stpl")]
struct InstructionsTemplate {
    pubkey: String,
    privkey: String,
    expdate: String,
    config_file: String,
}

pub fn generate_instructions(
    pubkey: String,
    privkey: String,
    expdate: String,
    config_file: &str,
) -> Result<String> {
    Ok(InstructionsTemplate {
        pubkey,
        privkey,
        expdate,
        config_file: config_file.to_string(),
    }
    .render_once()?)
}

pub fn generate_certificate(userid: &str) -> Result<GeneratedCert> {
    let now = std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)?
        .as_secs();
    let (cert, _) = CertBuilder::new()
        .add_userid(userid)
        .set_validity_period(Duration::from_secs(CERT_LIFETIME))
        .add_subkey(
            KeyFlags::empty().set_signing().set_authentication(),
            None,
            None,
        )
        .generate()?;
    let pubkey = SecretSlice::from(cert.armored().to_vec()?);
    let privkey = SecretSlice::from(cert.as_tsk().armored().to_vec()?);
    let id = cert.fingerprint().to_string();
    // sequoia backdates the timestamp by 60 seconds so signatures are immediately binding
    let expiry = now + CERT_LIFETIME - 60;

    Ok(GeneratedCert {
        id,
        pubkey,
        privkey,
        expiry,
    })
}

pub fn load_certificate<P: AsRef<Path>>(cert_path: P) -> Result<Cert> {
    Cert::from_file(cert_path.as_ref())
}

fn is_icon_filename(name: &str) -> bool {
    matches!(
        name,
        "PACKAGE_ICON.PNG" | "PACKAGE_ICON_120.PNG" | "PACKAGE_ICON_256.PNG"
    )
}

fn is_wizard_filename(name: &str) -> bool {
    crate::spk::match_wizard_filename(name).is_some()
}

fn is_conf_filename(name: &str) -> bool {
    name.starts_with("conf/")
}

fn is_script_filename(name: &str) -> bool {
    name.starts_with("scripts/")
}

fn strip_dot_slash(name: &str) -> &str {
    name.strip_prefix("./").unwrap_or(name)
}

fn read_members(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut members = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        members.insert(strip_dot_slash(&path).to_string(), buf);
    }
    Ok(members)
}

/// Concatenates the bytes that get signed, in the fixed order the original
/// signer used: INFO, LICENSE, icons, wizards, conf, package.tgz, scripts.
/// Sorted name order within each group, same as iterating a sorted tar
/// member list.
fn canonical_bytes(members: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(info) = members.get("INFO") {
        out.extend_from_slice(info);
    }
    if let Some(license) = members.get("LICENSE") {
        out.extend_from_slice(license);
    }
    for (name, bytes) in members {
        if is_icon_filename(name) {
            out.extend_from_slice(bytes);
        }
    }
    for (name, bytes) in members {
        if is_wizard_filename(name) {
            out.extend_from_slice(bytes);
        }
    }
    for (name, bytes) in members {
        if is_conf_filename(name) {
            out.extend_from_slice(bytes);
        }
    }
    if let Some(pkg) = members.get("package.tgz") {
        out.extend_from_slice(pkg);
    }
    for (name, bytes) in members {
        if is_script_filename(name) {
            out.extend_from_slice(bytes);
        }
    }
    out
}

/// Produces a detached, ASCII-armored, remotely-timestamped signature over
/// an SPK's canonical bytes. Implementations may call out to a local
/// gpg-agent (production) or return a fixed value (tests).
pub trait DetachedSigner {
    fn sign(&self, content: &[u8]) -> Result<String, IoError>;
}

/// Offloads the actual signing operation to a running gpg-agent, then has
/// the signature remotely timestamped and verifies the response before
/// handing it back.
pub struct AgentSigner {
    pub cert: Cert,
    pub timestamp_url: String,
    pub http: reqwest::blocking::Client,
}

impl AgentSigner {
    pub fn new(cert: Cert, timestamp_url: String) -> Result<AgentSigner> {
        let http = reqwest::blocking::Client::builder()
            .timeout(TIMESTAMP_REQUEST_TIMEOUT)
            .build()?;
        Ok(AgentSigner {
            cert,
            timestamp_url,
            http,
        })
    }

    fn sign_with_agent(&self, content: &[u8]) -> Result<Vec<u8>> {
        use sequoia_gpg_agent::gnupg::Context;
        use sequoia_gpg_agent::KeyPair;

        let policy = StandardPolicy::new();
        let keypair = self
            .cert
            .keys()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .ok_or_else(|| anyhow!("No usable signing key found in the configured certificate"))?;
        let ctx = Context::new()?;
        let offloaded = KeyPair::new_for_gnupg_context(&ctx, keypair.key())?;
        let mut data_sink = Vec::new();
        let message = Message::new(&mut data_sink);
        let mut message = Signer::new(message, offloaded)?.detached().build()?;
        message.write_all(content)?;
        message.finalize()?;

        Ok(data_sink)
    }
}

impl DetachedSigner for AgentSigner {
    fn sign(&self, content: &[u8]) -> Result<String, IoError> {
        let signature = self.sign_with_agent(content).map_err(|_| IoError::SignFailed)?;

        let response = self
            .http
            .post(&self.timestamp_url)
            .multipart(
                reqwest::blocking::multipart::Form::new()
                    .part("file", reqwest::blocking::multipart::Part::bytes(signature)),
            )
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    IoError::TimestampTimeout
                } else {
                    IoError::SignFailed
                }
            })?;

        if !response.status().is_success() {
            return Err(IoError::SignFailed);
        }

        let timestamped = response.text().map_err(|_| IoError::SignFailed)?;
        verify_timestamp(&self.cert, &timestamped).map_err(|_| IoError::SignFailed)?;

        Ok(timestamped)
    }
}

fn verify_timestamp(cert: &Cert, armored: &str) -> Result<()> {
    use openpgp::parse::stream::{MessageStructure, VerificationHelper, VerifierBuilder};

    struct Helper<'a>(&'a Cert);
    impl VerificationHelper for Helper<'_> {
        fn get_certs(&mut self, _ids: &[openpgp::KeyHandle]) -> openpgp::Result<Vec<Cert>> {
            Ok(vec![self.0.clone()])
        }
        fn check(&mut self, _structure: MessageStructure) -> openpgp::Result<()> {
            Ok(())
        }
    }

    let policy = StandardPolicy::new();
    let mut verifier =
        VerifierBuilder::from_bytes(armored.as_bytes())?.with_policy(&policy, None, Helper(cert))?;
    let mut sink = Vec::new();
    verifier.read_to_end(&mut sink)?;
    Ok(())
}

/// Appends a detached signature to an unsigned SPK's tar stream.
///
/// Signing a package that already carries `syno_signature.asc` is rejected
/// (spec §4.4, "Signing a package with an existing signature ⇒ already-signed").
pub fn apply_signature(spk_bytes: &[u8], signature: &str) -> Result<Vec<u8>, IoError> {
    let members = read_members(spk_bytes).map_err(|_| IoError::FilesystemWriteFailed)?;
    if members.contains_key(SIGNATURE_FILENAME) {
        return Err(IoError::AlreadySigned);
    }

    let mut builder = Builder::new(Vec::new());
    for (name, bytes) in &members {
        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, bytes.as_slice())
            .map_err(|_| IoError::FilesystemWriteFailed)?;
    }
    let mut header = Header::new_gnu();
    header.set_size(signature.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, SIGNATURE_FILENAME, signature.as_bytes())
        .map_err(|_| IoError::FilesystemWriteFailed)?;

    builder.into_inner().map_err(|_| IoError::FilesystemWriteFailed)
}

/// Rewrites an SPK's tar stream with its signature member dropped.
///
/// Unsigning a package that carries no `syno_signature.asc` is rejected
/// (spec §4.4, "unsigning an unsigned package ⇒ not-signed").
pub fn strip_signature(spk_bytes: &[u8]) -> Result<Vec<u8>, IoError> {
    let members = read_members(spk_bytes).map_err(|_| IoError::FilesystemWriteFailed)?;
    if !members.contains_key(SIGNATURE_FILENAME) {
        return Err(IoError::NotSigned);
    }
    let mut builder = Builder::new(Vec::new());
    for (name, bytes) in &members {
        if name == SIGNATURE_FILENAME {
            continue;
        }
        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, bytes.as_slice())
            .map_err(|_| IoError::FilesystemWriteFailed)?;
    }
    builder.into_inner().map_err(|_| IoError::FilesystemWriteFailed)
}

/// Signs an unsigned SPK in place, returning the new tar bytes and the
/// detached signature that now lives inside them.
pub fn sign_spk(spk_bytes: &[u8], signer: &dyn DetachedSigner) -> Result<(Vec<u8>, String), IoError> {
    let members = read_members(spk_bytes).map_err(|_| IoError::FilesystemWriteFailed)?;
    let content = canonical_bytes(&members);
    let signature = signer.sign(&content)?;
    let signed = apply_signature(spk_bytes, &signature)?;
    Ok((signed, signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSigner(&'static str);
    impl DetachedSigner for StubSigner {
        fn sign(&self, _content: &[u8]) -> Result<String, IoError> {
            Ok(self.0.to_string())
        }
    }

    fn build_unsigned_spk() -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "INFO", &b"abcd"[..]).unwrap();
        let mut header = Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "package.tgz", &b"wxyz"[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn sign_spk_appends_signature_member() {
        let bytes = build_unsigned_spk();
        let (signed, signature) = sign_spk(&bytes, &StubSigner("fake-signature")).unwrap();
        assert_eq!(signature, "fake-signature");
        let members = read_members(&signed).unwrap();
        assert_eq!(
            members.get(SIGNATURE_FILENAME).map(Vec::as_slice),
            Some(&b"fake-signature"[..])
        );
    }

    #[test]
    fn signing_an_already_signed_spk_fails() {
        let bytes = build_unsigned_spk();
        let (signed, _) = sign_spk(&bytes, &StubSigner("s")).unwrap();
        assert!(matches!(
            apply_signature(&signed, "another"),
            Err(IoError::AlreadySigned)
        ));
    }

    #[test]
    fn unsigning_an_unsigned_spk_fails() {
        let bytes = build_unsigned_spk();
        assert!(matches!(strip_signature(&bytes), Err(IoError::NotSigned)));
    }

    #[test]
    fn strip_signature_removes_member() {
        let bytes = build_unsigned_spk();
        let (signed, _) = sign_spk(&bytes, &StubSigner("s")).unwrap();
        let unsigned = strip_signature(&signed).unwrap();
        let members = read_members(&unsigned).unwrap();
        assert!(!members.contains_key(SIGNATURE_FILENAME));
        assert!(members.contains_key("INFO"));
        assert!(members.contains_key("package.tgz"));
    }

    #[test]
    fn canonical_bytes_concatenates_in_fixed_order() {
        let mut members = BTreeMap::new();
        members.insert("INFO".to_string(), b"I".to_vec());
        members.insert("LICENSE".to_string(), b"L".to_vec());
        members.insert("PACKAGE_ICON.PNG".to_string(), b"72".to_vec());
        members.insert("package.tgz".to_string(), b"P".to_vec());
        members.insert("conf/PKG_DEPS".to_string(), b"C".to_vec());
        members.insert("scripts/preinst".to_string(), b"S".to_vec());
        let bytes = canonical_bytes(&members);
        assert_eq!(bytes, b"IL72CPS");
    }
}
