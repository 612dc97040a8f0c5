//! Short code generation.
//!
//! Generators are pure: they never consult storage. Uniqueness is enforced by
//! [`RedirectStore`](crate::store::RedirectStore), which retries on collision.

use rand::RngExt;

/// Characters a generated code may contain.
pub const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Default length of generated codes.
pub const DEFAULT_CODE_LENGTH: usize = 10;

/// Produces candidate short codes.
pub trait CodeGenerator: Send + Sync + 'static {
    /// Returns a code of exactly `length` characters.
    fn generate(&self, length: usize) -> String;
}

/// Draws each character uniformly from [`ALPHABET`] using the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self, length: usize) -> String {
        let mut rng = rand::rng();
        (0..length)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect()
    }
}
