// src/transport.rs
//
// The two collaborators that sit at the network boundary:
// - `CallEncoder` turns an address batch into the opaque call payload.
// - `Transport` performs one read-only round trip with that payload.

use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::prelude::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::metrics;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Failure of a single remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited by endpoint: {0}")]
    RateLimited(String),
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("call rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Timeouts, rate limits and connectivity problems are worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::RateLimited(_) => "rate_limited",
            TransportError::Unreachable(_) => "unreachable",
            TransportError::Rejected(_) => "rejected",
        }
    }

    /// Classify a provider error by its message.
    pub fn classify(message: &str, timeout: Duration) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("rate limit")
            || lower.contains("limit exceeded")
            || lower.contains("busy")
            || lower.contains("capacity")
        {
            TransportError::RateLimited(message.to_string())
        } else if lower.contains("timeout") || lower.contains("timed out") {
            TransportError::Timeout(timeout)
        } else if lower.contains("connect")
            || lower.contains("connection")
            || lower.contains("dns")
            || lower.contains("http error")
            || lower.contains("error sending request")
            || lower.contains("503")
            || lower.contains("502")
        {
            TransportError::Unreachable(message.to_string())
        } else {
            TransportError::Rejected(message.to_string())
        }
    }
}

/// One read-only round trip: payload in, raw return data out.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, payload: Bytes) -> Result<Bytes, TransportError>;
}

/// Builds the call payload for a batch of pool addresses.
pub trait CallEncoder: Send + Sync {
    fn encode(&self, pools: &[Address]) -> Bytes;
}

/// Deployless call payload: helper contract creation code followed by the
/// ABI-encoded `address[]` constructor argument. The constructor's return data
/// carries the pool metadata, so nothing needs to be deployed on chain.
#[derive(Debug, Clone)]
pub struct DeploylessEncoder {
    bytecode: Bytes,
}

impl DeploylessEncoder {
    pub fn new(bytecode: Bytes) -> Self {
        Self { bytecode }
    }

    /// Accepts the creation code as hex, with or without `0x`.
    pub fn from_hex(bytecode_hex: &str) -> Result<Self, hex::FromHexError> {
        let trimmed = bytecode_hex.trim();
        let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        Ok(Self::new(Bytes::from(hex::decode(body)?)))
    }

    pub fn bytecode_len(&self) -> usize {
        self.bytecode.len()
    }
}

impl CallEncoder for DeploylessEncoder {
    fn encode(&self, pools: &[Address]) -> Bytes {
        let args = encode(&[Token::Array(
            pools.iter().copied().map(Token::Address).collect(),
        )]);
        let mut data = Vec::with_capacity(self.bytecode.len() + args.len());
        data.extend_from_slice(&self.bytecode);
        data.extend_from_slice(&args);
        Bytes::from(data)
    }
}

/// `eth_call` transport over any ethers middleware.
///
/// The transaction has no `to`, so the node executes the payload as creation code.
pub struct RpcTransport<M: Middleware> {
    provider: Arc<M>,
    timeout: Duration,
    limiter: Option<DirectRateLimiter>,
}

impl RpcTransport<Provider<Http>> {
    /// Build an HTTP provider for `rpc_url`.
    pub fn connect(rpc_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?;
        Ok(Self::new(Arc::new(provider), timeout))
    }
}

impl<M: Middleware + 'static> RpcTransport<M> {
    pub fn new(provider: Arc<M>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            limiter: None,
        }
    }

    /// Cap outgoing calls to `qps` per second across all concurrent batches.
    pub fn with_rate_limit(mut self, qps: u32) -> Self {
        self.limiter = NonZeroU32::new(qps).map(|q| RateLimiter::direct(Quota::per_second(q)));
        self
    }
}

#[async_trait]
impl<M: Middleware + 'static> Transport for RpcTransport<M> {
    async fn call(&self, payload: Bytes) -> Result<Bytes, TransportError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let tx: TypedTransaction = TransactionRequest::new().data(payload).into();
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.provider.call(&tx, None)).await;
        let elapsed = start.elapsed();
        metrics::record_transport_latency(elapsed);

        match result {
            Err(_) => Err(TransportError::Timeout(self.timeout)),
            Ok(Err(e)) => {
                let err = TransportError::classify(&e.to_string(), self.timeout);
                debug!("eth_call failed after {:?}: {}", elapsed, err);
                Err(err)
            }
            Ok(Ok(data)) if data.is_empty() => {
                Err(TransportError::Rejected("empty response".to_string()))
            }
            Ok(Ok(data)) => {
                debug!("eth_call returned {} bytes in {:?}", data.len(), elapsed);
                Ok(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{decode, ParamType};

    #[test]
    fn test_classify_rate_limit_messages() {
        let timeout = Duration::from_secs(1);
        for msg in [
            "HTTP 429 Too Many Requests",
            "daily request limit exceeded",
            "server is busy, try again",
        ] {
            let err = TransportError::classify(msg, timeout);
            assert_eq!(err.kind(), "rate_limited", "message: {}", msg);
            assert!(err.is_transient());
        }
    }

    #[test]
    fn test_classify_timeout_unreachable_and_rejected() {
        let timeout = Duration::from_secs(2);
        assert_eq!(
            TransportError::classify("operation timed out", timeout),
            TransportError::Timeout(timeout)
        );
        assert_eq!(
            TransportError::classify("error sending request for url", timeout).kind(),
            "unreachable"
        );

        let revert = TransportError::classify("execution reverted", timeout);
        assert_eq!(revert.kind(), "rejected");
        assert!(!revert.is_transient());
    }

    #[test]
    fn test_deployless_payload_is_bytecode_then_args() {
        let encoder = DeploylessEncoder::from_hex("0x6080604052").unwrap();
        let pools = vec![Address::from_low_u64_be(1), Address::from_low_u64_be(2)];
        let payload = encoder.encode(&pools);

        assert_eq!(&payload[..5], &[0x60, 0x80, 0x60, 0x40, 0x52]);
        let args = decode(
            &[ParamType::Array(Box::new(ParamType::Address))],
            &payload[encoder.bytecode_len()..],
        )
        .unwrap();
        assert_eq!(
            args,
            vec![Token::Array(pools.into_iter().map(Token::Address).collect())]
        );
    }

    #[test]
    fn test_invalid_bytecode_hex_is_rejected() {
        assert!(DeploylessEncoder::from_hex("0xzz").is_err());
    }
}
