use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The all-zero address. Stands in for "not available" wherever an address is expected.
pub const ZERO_ADDRESS: Address = Address::zero();

/// Bytes accounted for every cached record regardless of its strings:
/// three addresses, two decimals and the cache bookkeeping (count, timestamp, sequence).
const FIXED_RECORD_BYTES: usize = 3 * 20 + 2 + 3 * 8;

/// ERC-20 style metadata for one side of a pool.
///
/// Empty `name`/`symbol` and zero `decimals` mean the value could not be retrieved,
/// not that the token reports an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl TokenMetadata {
    pub fn new(address: Address, name: impl Into<String>, symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            address,
            name: name.into(),
            symbol: symbol.into(),
            decimals,
        }
    }

    /// Sentinel for a token slot the pool does not expose.
    pub fn unavailable() -> Self {
        Self::new(ZERO_ADDRESS, "", "", 0)
    }

    pub fn is_unavailable(&self) -> bool {
        self.address == ZERO_ADDRESS
    }
}

/// Metadata of a two-token pool. `pool_address` is always the address the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pool_address: Address,
    pub token0: TokenMetadata,
    pub token1: TokenMetadata,
}

impl PoolRecord {
    pub fn new(pool_address: Address, token0: TokenMetadata, token1: TokenMetadata) -> Self {
        Self {
            pool_address,
            token0,
            token1,
        }
    }

    /// Record for a pool whose token accessors could not be resolved.
    pub fn unresolved(pool_address: Address) -> Self {
        Self::new(pool_address, TokenMetadata::unavailable(), TokenMetadata::unavailable())
    }

    /// Approximate in-memory footprint used by the byte-bounded cache mode.
    pub fn approx_size(&self) -> usize {
        FIXED_RECORD_BYTES
            + self.token0.name.len()
            + self.token0.symbol.len()
            + self.token1.name.len()
            + self.token1.symbol.len()
    }
}

impl fmt::Display for PoolRecord {
    /// `SYM0/SYM1(0xpool)` followed by one branch per token.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}/{}({:#x})",
            self.token0.symbol, self.token1.symbol, self.pool_address
        )?;
        writeln!(f, "├─ {}", self.token0.name)?;
        writeln!(f, "│    ├ {}", self.token0.symbol)?;
        writeln!(f, "│    ├ {:#x}", self.token0.address)?;
        writeln!(f, "│    └ {}", self.token0.decimals)?;
        writeln!(f, "└─ {}", self.token1.name)?;
        writeln!(f, "     ├ {}", self.token1.symbol)?;
        writeln!(f, "     ├ {:#x}", self.token1.address)?;
        write!(f, "     └ {}", self.token1.decimals)
    }
}
