//! Content hash algorithms.
//!
//! Every algorithm the core can use is registered here at compile time;
//! there is no runtime discovery. Backends are deterministic and hold no
//! shared state, so a single `&'static` instance serves all threads.

use blake2::{Blake2b512, Blake2s256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use sha3::Sha3_256;

/// Identifier of a registered hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgo {
    Sha256,
    Sha512,
    Sha3_256,
    Blake2b,
    Blake2s,
    Blake3,
}

impl HashAlgo {
    /// Every registered algorithm, in autotuner benchmark order.
    pub const ALL: [HashAlgo; 6] = [
        HashAlgo::Blake3,
        HashAlgo::Blake2b,
        HashAlgo::Blake2s,
        HashAlgo::Sha256,
        HashAlgo::Sha512,
        HashAlgo::Sha3_256,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
            HashAlgo::Sha3_256 => "sha3_256",
            HashAlgo::Blake2b => "blake2b",
            HashAlgo::Blake2s => "blake2s",
            HashAlgo::Blake3 => "blake3",
        }
    }

    pub fn from_name(name: &str) -> Option<HashAlgo> {
        match name {
            "sha256" => Some(HashAlgo::Sha256),
            "sha512" => Some(HashAlgo::Sha512),
            "sha3_256" | "sha3-256" => Some(HashAlgo::Sha3_256),
            "blake2b" => Some(HashAlgo::Blake2b),
            "blake2s" => Some(HashAlgo::Blake2s),
            "blake3" => Some(HashAlgo::Blake3),
            _ => None,
        }
    }

    /// The registered backend for this algorithm.
    pub fn algorithm(self) -> &'static dyn HashAlgorithm {
        match self {
            HashAlgo::Sha256 => &Sha256Algorithm,
            HashAlgo::Sha512 => &Sha512Algorithm,
            HashAlgo::Sha3_256 => &Sha3Algorithm,
            HashAlgo::Blake2b => &Blake2bAlgorithm,
            HashAlgo::Blake2s => &Blake2sAlgorithm,
            HashAlgo::Blake3 => &Blake3Algorithm,
        }
    }

    pub fn digest_len(self) -> usize {
        self.algorithm().digest_len()
    }

    /// One-shot digest of a byte slice.
    pub fn hash_bytes(self, bytes: &[u8]) -> Vec<u8> {
        let mut state = self.algorithm().new_hasher();
        state.update(bytes);
        state.finalize()
    }
}

/// A hash algorithm backend.
pub trait HashAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;
    fn digest_len(&self) -> usize;
    fn new_hasher(&self) -> Box<dyn HashState>;
}

/// Streaming hash state produced by [`HashAlgorithm::new_hasher`].
pub trait HashState: Send {
    fn update(&mut self, bytes: &[u8]);
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

// RustCrypto-family algorithms share one adapter over the Digest trait.
struct DigestState<D: Digest>(D);

impl<D: Digest + Send> HashState for DigestState<D> {
    fn update(&mut self, bytes: &[u8]) {
        Digest::update(&mut self.0, bytes);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

macro_rules! digest_algorithm {
    ($ty:ident, $digest:ty, $name:literal, $len:literal) => {
        struct $ty;

        impl HashAlgorithm for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn digest_len(&self) -> usize {
                $len
            }

            fn new_hasher(&self) -> Box<dyn HashState> {
                Box::new(DigestState(<$digest>::new()))
            }
        }
    };
}

digest_algorithm!(Sha256Algorithm, Sha256, "sha256", 32);
digest_algorithm!(Sha512Algorithm, Sha512, "sha512", 64);
digest_algorithm!(Sha3Algorithm, Sha3_256, "sha3_256", 32);
digest_algorithm!(Blake2bAlgorithm, Blake2b512, "blake2b", 64);
digest_algorithm!(Blake2sAlgorithm, Blake2s256, "blake2s", 32);

struct Blake3Algorithm;

struct Blake3State(blake3::Hasher);

impl HashAlgorithm for Blake3Algorithm {
    fn name(&self) -> &'static str {
        "blake3"
    }

    fn digest_len(&self) -> usize {
        32
    }

    fn new_hasher(&self) -> Box<dyn HashState> {
        Box::new(Blake3State(blake3::Hasher::new()))
    }
}

impl HashState for Blake3State {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().as_bytes().to_vec()
    }
}
