use chrono::{Datelike, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

const FIRST_NAMES: &[&str] = &[
    "alex", "sam", "jordan", "casey", "morgan", "taylor", "riley", "quinn", "avery", "rowan",
    "emery", "sage", "blake", "drew", "reese", "jamie",
];

const LAST_NAMES: &[&str] = &[
    "almeida", "barros", "costa", "duarte", "ferreira", "gomes", "lima", "martins", "nunes",
    "oliveira", "pereira", "ramos", "santos", "teixeira", "vieira",
];

const PASSWORD_LOWER: &[u8] = b"abcdefghjkmnpqrstuvwxyz";
const PASSWORD_UPPER: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ";
const PASSWORD_DIGITS: &[u8] = b"23456789";
const PASSWORD_SYMBOLS: &[u8] = b"!#$%&*+-_";

const PASSWORD_LEN: usize = 14;

/// Synthetic person attached to one enrollment session. The mailbox address
/// comes from the mail provider, not from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub first_name: String,
    pub last_name: String,
    pub password: String,
    pub birth_year: i32,
    pub birth_month: u32,
    pub birth_day: u32,
}

impl Identity {
    pub fn display_name(&self) -> String {
        format!(
            "{} {}",
            capitalize(&self.first_name),
            capitalize(&self.last_name)
        )
    }
}

/// Produces identities that satisfy the usual signup-form constraints: an
/// adult birth date and a password containing all four character classes.
#[derive(Debug, Default)]
pub struct IdentityGenerator;

impl IdentityGenerator {
    pub fn generate(&self) -> Identity {
        let mut rng = rand::thread_rng();
        let first = FIRST_NAMES.choose(&mut rng).copied().unwrap_or("alex");
        let last = LAST_NAMES.choose(&mut rng).copied().unwrap_or("santos");
        let current_year = Utc::now().year();
        Identity {
            first_name: first.to_string(),
            last_name: last.to_string(),
            password: generate_password(&mut rng),
            birth_year: current_year - rng.gen_range(21..=45),
            birth_month: rng.gen_range(1..=12),
            birth_day: rng.gen_range(1..=28),
        }
    }
}

fn generate_password<R: Rng>(rng: &mut R) -> String {
    let mut chars: Vec<u8> = Vec::with_capacity(PASSWORD_LEN);
    // One guaranteed character per class, the rest drawn from all of them.
    for class in [
        PASSWORD_LOWER,
        PASSWORD_UPPER,
        PASSWORD_DIGITS,
        PASSWORD_SYMBOLS,
    ] {
        chars.push(*class.choose(rng).unwrap_or(&b'x'));
    }
    let all: Vec<u8> = [
        PASSWORD_LOWER,
        PASSWORD_UPPER,
        PASSWORD_DIGITS,
        PASSWORD_SYMBOLS,
    ]
    .concat();
    while chars.len() < PASSWORD_LEN {
        chars.push(*all.choose(rng).unwrap_or(&b'x'));
    }
    chars.shuffle(rng);
    String::from_utf8(chars).unwrap_or_else(|_| "Fallback#Pass24".to_string())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_contains_all_character_classes() {
        let identity = IdentityGenerator.generate();
        let pw = identity.password.as_bytes();
        assert_eq!(pw.len(), PASSWORD_LEN);
        assert!(pw.iter().any(|c| PASSWORD_LOWER.contains(c)));
        assert!(pw.iter().any(|c| PASSWORD_UPPER.contains(c)));
        assert!(pw.iter().any(|c| PASSWORD_DIGITS.contains(c)));
        assert!(pw.iter().any(|c| PASSWORD_SYMBOLS.contains(c)));
    }

    #[test]
    fn birth_date_is_adult_and_valid() {
        let identity = IdentityGenerator.generate();
        let age = Utc::now().year() - identity.birth_year;
        assert!((21..=45).contains(&age));
        assert!((1..=12).contains(&identity.birth_month));
        assert!((1..=28).contains(&identity.birth_day));
    }

    #[test]
    fn display_name_is_capitalized() {
        let identity = Identity {
            first_name: "alex".into(),
            last_name: "santos".into(),
            password: "x".into(),
            birth_year: 1990,
            birth_month: 1,
            birth_day: 1,
        };
        assert_eq!(identity.display_name(), "Alex Santos");
    }
}
