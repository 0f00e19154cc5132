use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha384};

use crate::{
    config::SignatureScheme,
    error::{IntegrityError, ProtocolError, StorageError},
    platform::Platform,
    slot::{Slot, SlotStore},
};

pub const SHA384_LEN: usize = 48;
pub const LENGTH_FIELD_LEN: usize = 4;
pub const ED25519_SIGNATURE_LEN: usize = 64;
pub const ED25519_KEY_LEN: usize = 32;

/// Parsed `main.bin.sig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureArtifact {
    Sha384Length {
        digest: [u8; SHA384_LEN],
        declared_length: u32,
    },
    Ed25519 {
        signature: [u8; ED25519_SIGNATURE_LEN],
        declared_length: u32,
    },
}

impl SignatureArtifact {
    pub fn expected_len(scheme: SignatureScheme) -> usize {
        match scheme {
            SignatureScheme::Sha384Length => SHA384_LEN + LENGTH_FIELD_LEN,
            SignatureScheme::Ed25519 => ED25519_SIGNATURE_LEN + LENGTH_FIELD_LEN,
        }
    }

    pub fn parse(scheme: SignatureScheme, raw: &[u8]) -> Result<Self, ProtocolError> {
        let expected = Self::expected_len(scheme);
        if raw.len() != expected {
            return Err(ProtocolError::MalformedSignature {
                len: raw.len(),
                expected,
            });
        }

        let (head, tail) = raw.split_at(expected - LENGTH_FIELD_LEN);
        let declared_length = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let malformed = || ProtocolError::MalformedSignature {
            len: raw.len(),
            expected,
        };

        Ok(match scheme {
            SignatureScheme::Sha384Length => Self::Sha384Length {
                digest: head.try_into().map_err(|_| malformed())?,
                declared_length,
            },
            SignatureScheme::Ed25519 => Self::Ed25519 {
                signature: head.try_into().map_err(|_| malformed())?,
                declared_length,
            },
        })
    }

    pub fn declared_length(&self) -> u64 {
        match self {
            Self::Sha384Length {
                declared_length, ..
            }
            | Self::Ed25519 {
                declared_length, ..
            } => u64::from(*declared_length),
        }
    }

    /// Checks the digest of the slot contents against this artifact.
    pub fn verify(
        &self,
        digest: &[u8; SHA384_LEN],
        key: Option<&VerifyingKey>,
    ) -> Result<(), IntegrityError> {
        match self {
            Self::Sha384Length { digest: expected, .. } => {
                if expected == digest {
                    Ok(())
                } else {
                    Err(IntegrityError::DigestMismatch {
                        expected: hex::encode(expected),
                        actual: hex::encode(digest),
                    })
                }
            }
            Self::Ed25519 { signature, .. } => {
                let key = key.ok_or(IntegrityError::InvalidPublicKey)?;
                let signature = Signature::from_bytes(signature);
                key.verify(digest, &signature)
                    .map_err(|_| IntegrityError::BadSignature)
            }
        }
    }
}

pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey, IntegrityError> {
    let mut bytes = [0_u8; ED25519_KEY_LEN];
    hex::decode_to_slice(encoded.trim(), &mut bytes)
        .map_err(|_| IntegrityError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| IntegrityError::InvalidPublicKey)
}

/// SHA-384 over exactly `len` bytes of `slot`, `chunk_size` bytes at a time.
pub fn digest_slot<S: SlotStore + ?Sized, P: Platform + ?Sized>(
    slots: &S,
    slot: &Slot,
    len: u64,
    chunk_size: usize,
    platform: &P,
) -> Result<[u8; SHA384_LEN], StorageError> {
    let mut hasher = Sha384::new();
    let mut chunk = vec![0_u8; chunk_size.max(1)];
    let mut offset = 0_u64;

    while offset < len {
        let take = (len - offset).min(chunk.len() as u64) as usize;
        slots.read(slot, offset, &mut chunk[..take])?;
        hasher.update(&chunk[..take]);
        offset += take as u64;
        platform.feed_watchdog();
    }

    let mut digest = [0_u8; SHA384_LEN];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

pub fn sha384(data: &[u8]) -> [u8; SHA384_LEN] {
    let mut digest = [0_u8; SHA384_LEN];
    digest.copy_from_slice(&Sha384::digest(data));
    digest
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        platform::ResetReason,
        slot::MemorySlotStore,
        testing::{sha384_artifact, RecordingPlatform},
    };

    #[test]
    fn hash_artifact_layout() {
        let image = vec![0xE9_u8; 1000];
        let raw = sha384_artifact(&image);
        assert_eq!(raw.len(), 52);

        let artifact = SignatureArtifact::parse(SignatureScheme::Sha384Length, &raw).unwrap();
        assert_eq!(artifact.declared_length(), 1000);
        let expected = sha384(&image);
        assert_eq!(artifact.verify(&expected, None), Ok(()));
    }

    #[test]
    fn short_artifacts_are_malformed() {
        assert_eq!(
            SignatureArtifact::parse(SignatureScheme::Sha384Length, &[0_u8; 51]),
            Err(ProtocolError::MalformedSignature {
                len: 51,
                expected: 52
            })
        );
        assert!(SignatureArtifact::parse(SignatureScheme::Ed25519, &[0_u8; 52]).is_err());
        assert!(SignatureArtifact::parse(SignatureScheme::Sha384Length, &[]).is_err());
    }

    #[test]
    fn digest_mismatch_reports_both_digests() {
        let raw = sha384_artifact(b"original");
        let artifact = SignatureArtifact::parse(SignatureScheme::Sha384Length, &raw).unwrap();
        let other = sha384(b"tampered");
        assert!(matches!(
            artifact.verify(&other, None),
            Err(IntegrityError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn ed25519_signature_over_digest() {
        let signing = SigningKey::from_bytes(&[7_u8; 32]);
        let digest = sha384(b"image bytes");
        let mut raw = signing.sign(&digest).to_bytes().to_vec();
        raw.extend_from_slice(&11_u32.to_be_bytes());

        let artifact = SignatureArtifact::parse(SignatureScheme::Ed25519, &raw).unwrap();
        let key = parse_public_key(&hex::encode(signing.verifying_key().as_bytes())).unwrap();
        assert_eq!(artifact.declared_length(), 11);
        assert_eq!(artifact.verify(&digest, Some(&key)), Ok(()));

        let wrong = sha384(b"image bytez");
        assert_eq!(
            artifact.verify(&wrong, Some(&key)),
            Err(IntegrityError::BadSignature)
        );
        assert_eq!(
            artifact.verify(&digest, None),
            Err(IntegrityError::InvalidPublicKey)
        );
    }

    #[test]
    fn slot_digest_reads_exactly_the_declared_length() {
        let slots = MemorySlotStore::new(2, 16 * 1024, "ota_0");
        let image: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
        slots.fill("ota_1", &image);
        let target = slots.find_inactive_slot().unwrap().unwrap();
        let platform = RecordingPlatform::new(ResetReason::Software, "1.0.0");

        let digest = digest_slot(&slots, &target, image.len() as u64, 4096, &platform).unwrap();
        let expected = sha384(&image);
        assert_eq!(digest, expected);
        assert_eq!(platform.watchdog_feeds(), 3);
    }

    #[test]
    fn public_key_must_be_32_hex_bytes() {
        let signing = SigningKey::from_bytes(&[7_u8; 32]);
        let encoded = hex::encode_upper(signing.verifying_key().as_bytes());
        assert_eq!(
            parse_public_key(&format!(" {encoded}\n")),
            Ok(signing.verifying_key())
        );
        assert_eq!(parse_public_key("00"), Err(IntegrityError::InvalidPublicKey));
        assert_eq!(
            parse_public_key(&"zz".repeat(32)),
            Err(IntegrityError::InvalidPublicKey)
        );
    }

    #[test]
    fn digest_mismatch_is_reported_in_hex() {
        let raw = sha384_artifact(b"original");
        let artifact = SignatureArtifact::parse(SignatureScheme::Sha384Length, &raw).unwrap();
        let Err(IntegrityError::DigestMismatch { expected, actual }) =
            artifact.verify(&sha384(b"tampered"), None)
        else {
            panic!("expected a digest mismatch");
        };
        assert_eq!(expected, hex::encode(sha384(b"original")));
        assert_eq!(actual.len(), 96);
    }
}
