//! Frame padding for traffic shaping

use super::MuxError;
use rand::Rng;
use std::str::FromStr;

/// Padding strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingStrategy {
    /// No padding
    None,
    /// Pad to fixed block size
    Block(usize),
    /// Random padding up to max bytes
    Random(usize),
    /// Pad to power of 2
    PowerOfTwo,
}

impl FromStr for PaddingStrategy {
    type Err = MuxError;

    /// `none`, `block:N`, `random:N` or `pow2`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MuxError::InvalidConfig(format!("padding strategy {}", s));
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s, None),
        };
        let size = || -> Result<usize, MuxError> {
            arg.and_then(|a| a.parse().ok())
                .filter(|n| *n > 0)
                .ok_or_else(invalid)
        };

        match name {
            "none" => Ok(PaddingStrategy::None),
            "block" => Ok(PaddingStrategy::Block(size()?)),
            "random" => Ok(PaddingStrategy::Random(size()?)),
            "pow2" => Ok(PaddingStrategy::PowerOfTwo),
            _ => Err(invalid()),
        }
    }
}

/// Padding configuration
#[derive(Debug, Clone)]
pub struct PaddingConfig {
    /// Strategy for outgoing data frames
    pub strategy: PaddingStrategy,
    /// Minimum frame payload size (pad small frames)
    pub min_size: usize,
    /// Maximum padding to add, never more than 255
    pub max_padding: usize,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            strategy: PaddingStrategy::Block(64),
            min_size: 64,
            max_padding: 255,
        }
    }
}

impl PaddingConfig {
    /// Calculate padding for a given payload length
    pub fn calculate_padding(&self, data_len: usize) -> usize {
        let base_padding = self.min_size.saturating_sub(data_len);

        let strategy_padding = match self.strategy {
            PaddingStrategy::None => 0,
            PaddingStrategy::Block(block_size) => {
                let remainder = (data_len + base_padding) % block_size;
                if remainder == 0 {
                    0
                } else {
                    block_size - remainder
                }
            }
            PaddingStrategy::Random(max) => {
                let cap = max.min(self.max_padding);
                if cap == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..cap)
                }
            }
            PaddingStrategy::PowerOfTwo => {
                let total = data_len + base_padding;
                total.next_power_of_two() - total
            }
        };

        (base_padding + strategy_padding).min(self.max_padding.min(u8::MAX as usize))
    }
}
