//! Unique watermark generation with bounded collision retry.

use crate::codec::{Watermark, ALPHABET};
use async_trait::async_trait;
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

pub const MIN_LEN: usize = 3;
pub const MAX_LEN: usize = 15;

/// Where generated codes are reserved. `reserve` must be atomic: it returns
/// `true` only for the single caller that claimed `code` first.
#[async_trait]
pub trait CodeRegistry: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn reserve(&self, code: &Watermark, owner: Uuid) -> Result<bool, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError<E: std::error::Error + 'static> {
    #[error("watermark registry error: {0}")]
    Registry(#[source] E),

    #[error("no free watermark after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

/// Draws random codes and reserves the first free one.
#[derive(Debug, Clone)]
pub struct WatermarkGenerator {
    min_len: usize,
    max_len: usize,
    max_attempts: u32,
}

impl Default for WatermarkGenerator {
    fn default() -> Self {
        Self::new(MIN_LEN, MAX_LEN, 10)
    }
}

impl WatermarkGenerator {
    /// Lengths are clamped to `MIN_LEN..=MAX_LEN`.
    pub fn new(min_len: usize, max_len: usize, max_attempts: u32) -> Self {
        let min_len = min_len.clamp(MIN_LEN, MAX_LEN);
        let max_len = max_len.clamp(min_len, MAX_LEN);
        Self {
            min_len,
            max_len,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Draw a random code without reserving it.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Watermark {
        let len = rng.gen_range(self.min_len..=self.max_len);
        let indices: Vec<usize> = (0..len).map(|_| rng.gen_range(0..ALPHABET.len())).collect();
        Watermark::from_indices(&indices)
    }

    /// Generate and reserve a code for `owner`.
    pub async fn generate<R>(&self, registry: &R, owner: Uuid) -> Result<Watermark, GenerateError<R::Error>>
    where
        R: CodeRegistry + ?Sized,
    {
        for attempt in 1..=self.max_attempts {
            let code = self.draw(&mut rand::thread_rng());
            if registry.reserve(&code, owner).await.map_err(GenerateError::Registry)? {
                return Ok(code);
            }
            debug!(attempt, code = %code, owner = %owner, "Watermark collision, drawing again");
        }
        Err(GenerateError::RetryExhausted {
            attempts: self.max_attempts,
        })
    }
}
