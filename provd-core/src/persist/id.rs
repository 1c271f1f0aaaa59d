//! Document id generators.

use rand::RngCore;

/// Generates candidate document ids.
///
/// The collection retries on collision with the existing id set, up to a
/// bounded number of attempts.
#[derive(Debug, Clone)]
pub enum IdGenerator {
    /// `prefix0`, `prefix1`, ...
    Numeric { prefix: String, next: u64 },
    /// Random uuid4 in hex form.
    Uuid,
    /// Random bytes from the system generator, hex encoded.
    Urandom { length: usize },
}

impl IdGenerator {
    /// Build a generator from its configured name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "numeric" => Some(IdGenerator::Numeric {
                prefix: String::new(),
                next: 0,
            }),
            "default" | "uuid" => Some(IdGenerator::Uuid),
            "urandom" => Some(IdGenerator::Urandom { length: 12 }),
            _ => None,
        }
    }

    /// Produce the next candidate id.
    pub fn next_id(&mut self) -> String {
        match self {
            IdGenerator::Numeric { prefix, next } => {
                let id = format!("{prefix}{next}");
                *next += 1;
                id
            }
            IdGenerator::Uuid => uuid::Uuid::new_v4().simple().to_string(),
            IdGenerator::Urandom { length } => {
                let mut bytes = vec![0u8; *length];
                rand::thread_rng().fill_bytes(&mut bytes);
                hex::encode(bytes)
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::Uuid
    }
}
