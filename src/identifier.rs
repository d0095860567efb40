//! Client identifier generation

use crate::config::SamplerConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Symbols a random suffix is drawn from
pub const SUFFIX_ALPHABET: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Appends `suffix_len` random alphanumeric symbols to `prefix`.
///
/// Each call seeds its own generator, so sessions started at the same moment
/// on different workers still end up with distinct suffixes.
pub fn generate_client_id(prefix: &str, suffix_len: usize) -> String {
    let mut rng = StdRng::from_entropy();
    let mut id = String::with_capacity(prefix.len() + suffix_len);
    id.push_str(prefix);
    for _ in 0..suffix_len {
        let pos = rng.gen_range(0..SUFFIX_ALPHABET.len());
        id.push(SUFFIX_ALPHABET[pos] as char);
    }
    id
}

/// Client id a session should register under
pub fn resolve_client_id(config: &SamplerConfig) -> String {
    if config.random_suffix {
        generate_client_id(&config.client_id, config.suffix_length)
    } else {
        config.client_id.clone()
    }
}
