//! Keyed IPv4 anonymization for the update stream.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

/// Domain separator so digests cannot be cross-referenced with other
/// deployments hashing the same addresses.
const DIGEST_DOMAIN: &[u8] = b"flowmon-ip-digest-v1:";

/// One-way ip -> 64-bit digest keyed by a per-deployment seed.
///
/// The seed never leaves the process; equal addresses map to equal digests
/// within a deployment, which is all the update-stream consumers need.
pub struct Anonymizer {
    seed: Option<Vec<u8>>,
}

impl Anonymizer {
    /// Loads the seed from a file. The file must exist and be non-empty.
    pub fn from_seed_file(path: &Path) -> Result<Self> {
        let seed = std::fs::read(path)
            .with_context(|| format!("reading anonymization seed {}", path.display()))?;

        if seed.is_empty() {
            bail!("anonymization seed {} is empty", path.display());
        }

        Ok(Self { seed: Some(seed) })
    }

    /// Builds an anonymizer from seed bytes already in memory.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self {
            seed: Some(seed.to_vec()),
        }
    }

    /// An anonymizer with no seed; every `digest` call fails. This is the
    /// anonymization-failure path of the update writer.
    pub fn unseeded() -> Self {
        Self { seed: None }
    }

    /// Digests one address. Fails only when no seed is loaded.
    pub fn digest(&self, ip: Ipv4Addr) -> Result<u64> {
        let Some(seed) = &self.seed else {
            bail!("anonymization seed not loaded");
        };

        let mut hasher = Sha256::new();
        hasher.update(DIGEST_DOMAIN);
        hasher.update(seed);
        hasher.update(ip.octets());
        let digest = hasher.finalize();

        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Ok(u64::from_be_bytes(head))
    }
}
