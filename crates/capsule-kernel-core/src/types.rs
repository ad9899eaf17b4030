//! Strong type definitions for the Capsule Kernel.
//!
//! All content-addressed identifiers are 32-byte newtypes so a proof id can
//! never be passed where a capsule id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Convert to hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }

            /// The zero id (sentinel).
            pub const ZERO: Self = Self([0u8; 32]);
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; 32] = slice.try_into()?;
                Ok(Self(arr))
            }
        }
    };
}

digest_id!(
    /// Identifier of a sealed proof object. Equal to its seal digest, so two
    /// proofs with identical sealed content share an id.
    ProofId
);

digest_id!(
    /// Identifier of a time capsule, derived from its subject, dimension,
    /// proof, calculation instant, and predecessor.
    CapsuleId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proof_id_hex_roundtrip() {
        let id = ProofId::from_bytes([0x42; 32]);
        let recovered = ProofId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_capsule_id_display_is_short() {
        let id = CapsuleId::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", id), "abababababababab");
        assert!(format!("{:?}", id).starts_with("CapsuleId("));
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        assert!(ProofId::from_hex("abcd").is_err());
    }
}
