use std::sync::{Mutex, OnceLock};

use rand::{Rng, RngCore};

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;
const PREFIX_LEN: usize = 12;
const SEQUENCE_LEN: usize = 10;
const TOKEN_LEN: usize = PREFIX_LEN + SEQUENCE_LEN;
const MAX_SEQUENCE: u64 = BASE.pow(SEQUENCE_LEN as u32);
const MIN_INCREMENT: u64 = 33;
const MAX_INCREMENT: u64 = 333;

/// A generator of short collision-resistant tokens
///
/// Tokens are 22 base-62 characters: a 12 character random prefix
/// followed by a 10 character counter. The counter advances by a
/// randomized step so that concurrent processes sharing a prefix
/// space do not produce adjacent tokens, and the prefix is re-seeded
/// whenever the counter overflows.
#[derive(Debug)]
pub(crate) struct Nuid {
    prefix: [u8; PREFIX_LEN],
    sequence: u64,
    increment: u64,
}

impl Nuid {
    pub(crate) fn new() -> Self {
        let mut this = Self {
            prefix: [0; PREFIX_LEN],
            sequence: rand::thread_rng().gen_range(0..MAX_SEQUENCE),
            increment: rand::thread_rng().gen_range(MIN_INCREMENT..MAX_INCREMENT),
        };
        this.randomize_prefix();
        this
    }

    fn randomize_prefix(&mut self) {
        let mut raw = [0u8; PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        for (out, byte) in self.prefix.iter_mut().zip(raw) {
            *out = DIGITS[usize::from(byte) % DIGITS.len()];
        }
    }

    pub(crate) fn next(&mut self) -> String {
        self.sequence += self.increment;
        if self.sequence >= MAX_SEQUENCE {
            self.randomize_prefix();
            self.sequence = rand::thread_rng().gen_range(0..MAX_SEQUENCE);
            self.increment = rand::thread_rng().gen_range(MIN_INCREMENT..MAX_INCREMENT);
        }

        let mut token = [0u8; TOKEN_LEN];
        token[..PREFIX_LEN].copy_from_slice(&self.prefix);

        let mut sequence = self.sequence;
        for out in token[PREFIX_LEN..].iter_mut().rev() {
            *out = DIGITS[(sequence % BASE) as usize];
            sequence /= BASE;
        }

        String::from_utf8(token.to_vec()).expect("token is always ascii")
    }
}

/// Produce the next token from the process-wide generator
pub(crate) fn next() -> String {
    static GLOBAL: OnceLock<Mutex<Nuid>> = OnceLock::new();

    GLOBAL
        .get_or_init(|| Mutex::new(Nuid::new()))
        .lock()
        .expect("nuid generator is never poisoned")
        .next()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{next, Nuid, TOKEN_LEN};

    #[test]
    fn token_shape() {
        let mut nuid = Nuid::new();
        for _ in 0..1000 {
            let token = nuid.next();
            assert_eq!(TOKEN_LEN, token.len());
            assert!(token.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn tokens_are_unique() {
        let mut nuid = Nuid::new();
        let tokens = (0..10_000).map(|_| nuid.next()).collect::<HashSet<_>>();
        assert_eq!(10_000, tokens.len());
    }

    #[test]
    fn shared_prefix_until_overflow() {
        let mut nuid = Nuid::new();
        let a = nuid.next();
        let b = nuid.next();
        assert_eq!(a[..12], b[..12]);
        assert_ne!(a[12..], b[12..]);
    }

    #[test]
    fn prefix_reseeds_on_overflow() {
        let mut nuid = Nuid::new();
        let before = nuid.next()[..12].to_owned();
        nuid.sequence = super::MAX_SEQUENCE - 1;
        let after = nuid.next()[..12].to_owned();
        assert_ne!(before, after);
    }

    #[test]
    fn global_generator() {
        assert_ne!(next(), next());
    }
}
