use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::chain::{FeeOracle, FeeQuote};
use crate::error::{AppResult, ChainError};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcErrorBody>,
}

/// Parse a JSON-RPC hex quantity such as `"0x3b9aca00"`
pub fn parse_quantity(value: &str) -> Result<u128, ChainError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::FeeQuoteUnavailable(format!("not a hex quantity: {}", value)))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| ChainError::FeeQuoteUnavailable(format!("bad quantity {}: {}", value, e)))
}

/// Fee oracle backed by a node's JSON-RPC endpoint
pub struct RpcFeeOracle {
    client: Client,
    url: String,
}

impl RpcFeeOracle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    async fn quantity(&self, method: &str) -> Result<u128, ChainError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params: Vec::new(),
        };

        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::FeeQuoteUnavailable(format!("{} request failed: {}", method, e)))?
            .json()
            .await
            .map_err(|e| ChainError::FeeQuoteUnavailable(format!("{} bad response: {}", method, e)))?;

        if let Some(error) = response.error {
            return Err(ChainError::FeeQuoteUnavailable(format!(
                "{} returned {}: {}",
                method, error.code, error.message
            )));
        }
        let result = response
            .result
            .ok_or_else(|| ChainError::FeeQuoteUnavailable(format!("{} returned no result", method)))?;
        parse_quantity(&result)
    }
}

#[async_trait]
impl FeeOracle for RpcFeeOracle {
    async fn fee_quote(&self) -> AppResult<FeeQuote> {
        let gas_price = self.quantity("eth_gasPrice").await?;
        let priority = match self.quantity("eth_maxPriorityFeePerGas").await {
            Ok(priority) => priority,
            Err(e) => {
                warn!("Priority fee unavailable, deriving from gas price: {}", e);
                gas_price / 10
            }
        };

        let quote = FeeQuote {
            max_fee_per_gas: gas_price.saturating_mul(2).saturating_add(priority),
            max_priority_fee_per_gas: priority,
        };
        debug!("Fee quote: {:?}", quote);
        Ok(quote)
    }
}
