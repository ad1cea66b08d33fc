//! Credentials for auto-provisioned accounts.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use rand::seq::SliceRandom;
use rand::Rng;
use secrecy::SecretString;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!@#$%^&*";

pub const GENERATED_LENGTH: usize = 12;

/// Random password with at least one character from every class.
pub fn generate_password() -> SecretString {
    let mut rng = rand::thread_rng();
    let classes = [LOWER, UPPER, DIGITS, SPECIAL];
    let all: Vec<u8> = classes.concat();

    let mut chars: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.gen_range(0..class.len())])
        .collect();
    while chars.len() < GENERATED_LENGTH {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);

    SecretString::from(chars.into_iter().map(char::from).collect::<String>())
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{PasswordHash, PasswordVerifier};
    use secrecy::ExposeSecret;

    fn verify_password(password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
    }

    #[test]
    fn generated_passwords_mix_all_classes() {
        for _ in 0..20 {
            let secret = generate_password();
            let password = secret.expose_secret();
            assert_eq!(password.len(), GENERATED_LENGTH);
            for class in [LOWER, UPPER, DIGITS, SPECIAL] {
                assert!(password.bytes().any(|b| class.contains(&b)), "{class:?}");
            }
        }
    }

    #[test]
    fn hash_verifies() {
        let hash = hash_password("s3cret!pass").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret!pass", &hash));
        assert!(!verify_password("other", &hash));
        assert!(!verify_password("s3cret!pass", "not-a-hash"));
    }

    #[test]
    fn debug_does_not_reveal_the_password() {
        let secret = generate_password();
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains(secret.expose_secret()));
    }
}
