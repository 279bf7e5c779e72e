// src/decoder.rs
//
// Decodes the return data of the metadata helper call into pool records.
//
// The helper returns the ABI encoding of
//
//     (address pool, Token token0, Token token1)[]
//     Token = (address token, string name, string symbol, uint8 decimals)
//
// Entries come back in request order. The array structure must be intact, otherwise the
// whole batch is rejected. Individual token fields are decoded on their own and fall back
// to sentinel values, so one broken `name()` never costs the rest of the record.

use ethers::abi::Token;
use ethers::types::{Address, U256};
use log::debug;
use thiserror::Error;

use crate::types::{PoolRecord, TokenMetadata, ZERO_ADDRESS};

const WORD: usize = 32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("payload truncated or offset out of bounds at byte {0}")]
    OutOfBounds(usize),
    #[error("expected {expected} pool entries, payload has {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("entry {index}: pool address {actual:#x} does not match requested {expected:#x}")]
    PoolMismatch {
        index: usize,
        expected: Address,
        actual: Address,
    },
    #[error("entry {index}: malformed pool address word")]
    MalformedPoolAddress { index: usize },
}

/// Bounds-checked view over ABI words.
struct AbiReader<'a> {
    data: &'a [u8],
}

impl<'a> AbiReader<'a> {
    fn word(&self, pos: usize) -> Option<&'a [u8]> {
        self.data.get(pos..pos.checked_add(WORD)?)
    }

    fn uint(&self, pos: usize) -> Option<U256> {
        self.word(pos).map(U256::from_big_endian)
    }

    fn offset(&self, pos: usize) -> Option<usize> {
        let value = self.uint(pos)?;
        if value.bits() > 64 {
            return None;
        }
        usize::try_from(value.as_u64()).ok()
    }

    /// Address words must be left-padded with zeros.
    fn address(&self, pos: usize) -> Option<Address> {
        let word = self.word(pos)?;
        if word[..12].iter().any(|b| *b != 0) {
            return None;
        }
        Some(Address::from_slice(&word[12..]))
    }

    fn string(&self, pos: usize) -> Option<String> {
        let len = self.offset(pos)?;
        let start = pos.checked_add(WORD)?;
        let bytes = self.data.get(start..start.checked_add(len)?)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Decode one batch payload. `requested` is the batch's address list in order.
pub fn decode_batch(payload: &[u8], requested: &[Address]) -> Result<Vec<PoolRecord>, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    let reader = AbiReader { data: payload };

    let root = reader.offset(0).ok_or(DecodeError::OutOfBounds(0))?;
    let count = reader.offset(root).ok_or(DecodeError::OutOfBounds(root))?;
    if count != requested.len() {
        return Err(DecodeError::CountMismatch {
            expected: requested.len(),
            actual: count,
        });
    }

    let elements = root + WORD;
    let mut records = Vec::with_capacity(count);

    for (index, expected) in requested.iter().copied().enumerate() {
        let head = elements + index * WORD;
        let entry = reader
            .offset(head)
            .and_then(|off| elements.checked_add(off))
            .ok_or(DecodeError::OutOfBounds(head))?;

        let pool = reader
            .address(entry)
            .ok_or(DecodeError::MalformedPoolAddress { index })?;

        if pool == ZERO_ADDRESS {
            debug!("Pool {:#x} not resolvable by helper, using sentinel tokens", expected);
            records.push(PoolRecord::unresolved(expected));
            continue;
        }
        if pool != expected {
            return Err(DecodeError::PoolMismatch {
                index,
                expected,
                actual: pool,
            });
        }

        let token0_at = entry + WORD;
        let token1_at = entry + 2 * WORD;
        let token0 = reader
            .offset(token0_at)
            .and_then(|off| entry.checked_add(off))
            .ok_or(DecodeError::OutOfBounds(token0_at))?;
        let token1 = reader
            .offset(token1_at)
            .and_then(|off| entry.checked_add(off))
            .ok_or(DecodeError::OutOfBounds(token1_at))?;

        records.push(PoolRecord::new(
            expected,
            decode_token(&reader, token0, expected, 0),
            decode_token(&reader, token1, expected, 1),
        ));
    }

    Ok(records)
}

fn decode_token(reader: &AbiReader<'_>, start: usize, pool: Address, slot: u8) -> TokenMetadata {
    let address = match reader.address(start) {
        Some(addr) if addr != ZERO_ADDRESS => addr,
        Some(_) => return TokenMetadata::unavailable(),
        None => {
            debug!("Pool {:#x} token{}: malformed address word", pool, slot);
            return TokenMetadata::unavailable();
        }
    };

    let name = read_string_field(reader, start, 1);
    let symbol = read_string_field(reader, start, 2);
    let decimals = reader
        .uint(start + 3 * WORD)
        .filter(|v| *v <= U256::from(u8::MAX))
        .map(|v| v.low_u32() as u8);

    if name.is_none() || symbol.is_none() || decimals.is_none() {
        debug!(
            "Pool {:#x} token{} {:#x}: missing fields (name: {}, symbol: {}, decimals: {})",
            pool,
            slot,
            address,
            name.is_some(),
            symbol.is_some(),
            decimals.is_some()
        );
    }

    TokenMetadata::new(
        address,
        name.unwrap_or_default(),
        symbol.unwrap_or_default(),
        decimals.unwrap_or(0),
    )
}

fn read_string_field(reader: &AbiReader<'_>, start: usize, field: usize) -> Option<String> {
    reader
        .offset(start + field * WORD)
        .and_then(|off| start.checked_add(off))
        .and_then(|pos| reader.string(pos))
}

/// ABI-encode records in the helper's return layout. Inverse of [`decode_batch`];
/// used by fixtures and in-memory transports.
pub fn encode_records(records: &[PoolRecord]) -> Vec<u8> {
    let token = |t: &TokenMetadata| {
        Token::Tuple(vec![
            Token::Address(t.address),
            Token::String(t.name.clone()),
            Token::String(t.symbol.clone()),
            Token::Uint(U256::from(t.decimals)),
        ])
    };
    let entries = records
        .iter()
        .map(|r| Token::Tuple(vec![Token::Address(r.pool_address), token(&r.token0), token(&r.token1)]))
        .collect();
    ethers::abi::encode(&[Token::Array(entries)])
}
