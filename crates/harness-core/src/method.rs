use std::fmt;

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::MethodError;

/// The closed set of transforms a processor can run.
///
/// Resolved once per session, either from the command line or from the
/// driver's method-name frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// SHA-256 over the whole input; always 32 bytes.
    Sha256,
    /// BLAKE3 over the whole input; always 32 bytes.
    Blake3,
    /// RIPEMD-160 left-padded with zeros to 32 bytes.
    Ripemd160,
    /// Output equals input.
    Identity,
}

/// Wire names accepted by [`Method::resolve`], grouped per method.
const NAMES: &[(Method, &[&str])] = &[
    (Method::Sha256, &["sha", "sha256"]),
    (Method::Blake3, &["blake3"]),
    (Method::Ripemd160, &["ripemd160"]),
    (Method::Identity, &["identity", "dataCopy"]),
];

impl Method {
    pub const ALL: [Method; 4] = [
        Method::Sha256,
        Method::Blake3,
        Method::Ripemd160,
        Method::Identity,
    ];

    /// Map a method name to its transform.
    pub fn resolve(name: &str) -> Result<Self, MethodError> {
        NAMES
            .iter()
            .find(|(_, names)| names.contains(&name))
            .map(|(method, _)| *method)
            .ok_or_else(|| MethodError::Unsupported(name.to_string()))
    }

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Method::Sha256 => "sha256",
            Method::Blake3 => "blake3",
            Method::Ripemd160 => "ripemd160",
            Method::Identity => "identity",
        }
    }

    /// Every name this method answers to.
    pub fn aliases(self) -> &'static [&'static str] {
        NAMES
            .iter()
            .find(|(m, _)| *m == self)
            .map(|(_, names)| *names)
            .unwrap_or(&[])
    }

    /// Output size when it does not depend on the input.
    pub fn fixed_output_len(self) -> Option<usize> {
        match self {
            Method::Sha256 | Method::Blake3 | Method::Ripemd160 => Some(32),
            Method::Identity => None,
        }
    }

    /// Apply the transform. Pure: same input, same output.
    pub fn apply(self, input: &[u8]) -> Result<Vec<u8>, MethodError> {
        Ok(match self {
            Method::Sha256 => Sha256::digest(input).to_vec(),
            Method::Blake3 => blake3::hash(input).as_bytes().to_vec(),
            Method::Ripemd160 => {
                let mut out = vec![0u8; 32];
                out[12..].copy_from_slice(&Ripemd160::digest(input));
                out
            }
            Method::Identity => input.to_vec(),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Method {
    type Err = MethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::resolve(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn sha_of_abc() {
        let out = Method::resolve("sha").unwrap().apply(b"abc").unwrap();
        assert_eq!(
            hex(&out),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha_of_empty_input() {
        let out = Method::Sha256.apply(&[]).unwrap();
        assert_eq!(
            hex(&out),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn blake3_of_empty_input() {
        let out = Method::Blake3.apply(&[]).unwrap();
        assert_eq!(
            hex(&out),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn ripemd160_of_abc_is_left_padded() {
        let out = Method::resolve("ripemd160").unwrap().apply(b"abc").unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(&out[..12], &[0u8; 12]);
        assert_eq!(hex(&out[12..]), "8eb208f7e05d987a9b044a8e98c6b087f15a0bfc");
    }

    #[test]
    fn digest_length_is_fixed() {
        for method in [Method::Sha256, Method::Blake3, Method::Ripemd160] {
            for len in [0usize, 1, 63, 64, 65, 4096] {
                let out = method.apply(&vec![0x5A; len]).unwrap();
                assert_eq!(Some(out.len()), method.fixed_output_len());
            }
        }
    }

    #[test]
    fn transforms_are_deterministic() {
        let input: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        for method in Method::ALL {
            assert_eq!(method.apply(&input), method.apply(&input));
        }
    }

    #[test]
    fn identity_copies() {
        assert_eq!(Method::Identity.apply(b"xyz").unwrap(), b"xyz");
        assert_eq!(Method::resolve("dataCopy").unwrap(), Method::Identity);
    }

    #[test]
    fn unknown_names_are_unsupported() {
        assert_eq!(
            Method::resolve("md5"),
            Err(MethodError::Unsupported("md5".into()))
        );
        assert!(Method::resolve("").is_err());
        assert!(Method::resolve("SHA").is_err());
    }

    #[test]
    fn every_alias_resolves_back() {
        for method in Method::ALL {
            assert!(!method.aliases().is_empty());
            for alias in method.aliases() {
                assert_eq!(Method::resolve(alias).unwrap(), method);
            }
            assert_eq!(method.name().parse::<Method>().unwrap(), method);
        }
    }
}
