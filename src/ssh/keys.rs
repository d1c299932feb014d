use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use russh_keys::PublicKeyBase64;
use russh_keys::key::{KeyPair, PublicKey};
use std::path::PathBuf;

/// Generates an ed25519 key pair. Returns the public key in authorized_keys
/// format and the private key as PKCS#8 PEM.
pub fn generate_key_pair(comment: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let generated: Option<KeyPair> = KeyPair::generate_ed25519().into();
    let key = generated.ok_or_else(|| Error::Upstream("failed to generate ed25519 key".into()))?;
    let public = key.clone_public_key()?;
    let mut private_pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut private_pem)?;
    let public_line = format!("{} {} {comment}", public.name(), public.public_key_base64());
    Ok((public_line.into_bytes(), private_pem))
}

/// Checks an imported private key and derives its public half. Returns the
/// same pair of formats as [`generate_key_pair`].
pub fn import_key_pair(private_key: &[u8], comment: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = decode_private_key(private_key)?;
    let public = key.clone_public_key()?;
    let public_line = format!("{} {} {comment}", public.name(), public.public_key_base64());
    Ok((public_line.into_bytes(), private_key.to_vec()))
}

pub fn decode_private_key(private_key: &[u8]) -> Result<KeyPair> {
    let pem = std::str::from_utf8(private_key)
        .map_err(|_| Error::invalid("private key is not valid utf-8"))?;
    Ok(russh_keys::decode_secret_key(pem, None)?)
}

/// authorized_keys line for a host key seen while connecting to `machine`.
pub fn authorized_key_line(key: &PublicKey, machine: &str, at: DateTime<Utc>) -> String {
    format_authorized_key(key.name(), &key.public_key_base64(), machine, at)
}

pub(crate) fn format_authorized_key(
    key_type: &str,
    base64: &str,
    machine: &str,
    at: DateTime<Utc>,
) -> String {
    format!(
        "{key_type} {base64} added by dockman for {machine} on {}",
        at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

/// Compares a pinned authorized_keys line against a presented key. Only the
/// key type and material take part; the comment is ignored.
pub(crate) fn pinned_key_matches(pinned: &str, key_type: &str, base64: &str) -> bool {
    let mut fields = pinned.split_whitespace();
    matches!(
        (fields.next(), fields.next()),
        (Some(t), Some(b)) if t == key_type && b == base64
    )
}

/// Private keys of the invoking user, in the order ssh would try them.
pub fn home_directory_keys() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return vec![];
    };
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.is_file())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn authorized_key_line_carries_comment() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let line = format_authorized_key("ssh-ed25519", "AAAAC3Nza", "nas", at);
        assert_eq!(
            line,
            "ssh-ed25519 AAAAC3Nza added by dockman for nas on 2024-05-01 12:30:00 UTC"
        );
    }

    #[test]
    fn pinned_key_ignores_comment() {
        let pinned = "ssh-ed25519 AAAAC3Nza added by dockman for nas on 2024-05-01";
        assert!(pinned_key_matches(pinned, "ssh-ed25519", "AAAAC3Nza"));
        assert!(!pinned_key_matches(pinned, "ssh-ed25519", "AAAAC3Nzb"));
        assert!(!pinned_key_matches(pinned, "ssh-rsa", "AAAAC3Nza"));
        assert!(!pinned_key_matches("", "ssh-ed25519", "AAAAC3Nza"));
    }

    #[test]
    fn generated_key_round_trips() {
        let (public, private) = generate_key_pair("default").unwrap();
        let public = String::from_utf8(public).unwrap();
        assert!(public.starts_with("ssh-ed25519 "));
        assert!(public.ends_with(" default"));

        let key = decode_private_key(&private).unwrap();
        let derived = key.clone_public_key().unwrap();
        assert!(pinned_key_matches(
            &public,
            derived.name(),
            &derived.public_key_base64()
        ));

        let (imported, _) = import_key_pair(&private, "laptop").unwrap();
        let imported = String::from_utf8(imported).unwrap();
        assert!(imported.ends_with(" laptop"));
        assert_eq!(
            imported.split_whitespace().nth(1),
            public.split_whitespace().nth(1)
        );
        assert!(import_key_pair(b"not a key", "x").is_err());
    }
}
