//! JSON-RPC client for Ethereum nodes
//!
//! Implements [`NodeClient`] over HTTP. Balance and call fan-outs are sent as
//! JSON-RPC batch requests in chunks of `batch_size`.

use crate::error::{Error, Result};
use crate::node::{ContractCall, NodeClient};
use crate::types::{parse_hex_u256, Block, Header, Receipt, Transaction, TransferLog};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Default number of requests per JSON-RPC batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// JSON-RPC client for Ethereum nodes.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    batch_size: usize,
}

impl RpcClient {
    /// Create a new RPC client.
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the number of requests per batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response: Value = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        extract_result(method, response)
    }

    /// Make a call whose `null` result means the object does not exist.
    async fn call_object<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        missing: impl FnOnce() -> Error,
    ) -> Result<T> {
        let result = self.call(method, params).await?;
        if result.is_null() {
            return Err(missing());
        }
        Ok(serde_json::from_value(result)?)
    }

    /// Send one JSON-RPC batch per chunk and return results in request order.
    async fn batch(&self, method: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(params.len());

        for chunk in params.chunks(self.batch_size) {
            let requests = chunk
                .iter()
                .enumerate()
                .map(|(id, p)| {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "method": method,
                        "params": p
                    })
                })
                .collect::<Vec<_>>();

            let responses: Vec<Value> = self
                .client
                .post(&self.url)
                .json(&requests)
                .send()
                .await?
                .json()
                .await?;

            if responses.len() != chunk.len() {
                return Err(Error::Rpc(format!(
                    "{method}: batch of {} returned {} responses",
                    chunk.len(),
                    responses.len()
                )));
            }

            // Responses may come back in any order
            let mut ordered = vec![Value::Null; chunk.len()];
            for response in responses {
                let id = response
                    .get("id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Rpc(format!("{method}: batch response without id")))?
                    as usize;
                let slot = ordered
                    .get_mut(id)
                    .ok_or_else(|| Error::Rpc(format!("{method}: unexpected batch id {id}")))?;
                *slot = extract_result(method, response)?;
            }
            results.extend(ordered);
        }

        Ok(results)
    }
}

fn extract_result(method: &str, mut response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        return Err(Error::Rpc(format!("{method}: {error}")));
    }
    response
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| Error::Rpc(format!("{method}: response missing 'result' field")))
}

fn hex_string(value: &Value) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| Error::Rpc(format!("expected hex string, got {value}")))
}

fn block_tag(number: Option<u64>) -> String {
    match number {
        Some(n) => format!("0x{:x}", n),
        None => "latest".to_string(),
    }
}

#[async_trait]
impl NodeClient for RpcClient {
    async fn block_by_hash(&self, hash: B256) -> Result<Block> {
        self.call_object("eth_getBlockByHash", json!([hash, true]), || {
            Error::BlockNotFound(hash.to_string())
        })
        .await
    }

    async fn block_by_number(&self, number: Option<u64>) -> Result<Block> {
        let tag = block_tag(number);
        self.call_object("eth_getBlockByNumber", json!([tag, true]), || {
            Error::BlockNotFound(tag.clone())
        })
        .await
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<(Transaction, bool)> {
        let tx: Transaction = self
            .call_object("eth_getTransactionByHash", json!([hash]), || Error::NotFound)
            .await?;
        let pending = tx.block_hash.is_none();
        Ok((tx, pending))
    }

    async fn uncle_by_block_hash_and_position(&self, hash: B256, index: u64) -> Result<Header> {
        self.call_object(
            "eth_getUncleByBlockHashAndIndex",
            json!([hash, format!("0x{:x}", index)]),
            || Error::BlockNotFound(format!("uncle {} of {}", index, hash)),
        )
        .await
    }

    async fn get_block_receipts(&self, hash: B256) -> Result<Vec<Receipt>> {
        self.call_object("eth_getBlockReceipts", json!([hash]), || {
            Error::BlockNotFound(hash.to_string())
        })
        .await
    }

    async fn get_total_difficulty(&self, hash: B256) -> Result<U256> {
        let block = self.call("eth_getBlockByHash", json!([hash, false])).await?;
        if block.is_null() {
            return Err(Error::BlockNotFound(hash.to_string()));
        }
        let td = block
            .get("totalDifficulty")
            .ok_or_else(|| Error::Rpc("block missing 'totalDifficulty' field".to_string()))?;
        parse_hex_u256(hex_string(td)?).map_err(|e| Error::Rpc(format!("bad totalDifficulty: {e}")))
    }

    async fn get_transfer_logs(&self, hash: B256) -> Result<Vec<TransferLog>> {
        self.call_object("debug_getTransferLogs", json!([hash]), || {
            Error::BlockNotFound(hash.to_string())
        })
        .await
    }

    async fn batch_balance_at(&self, addrs: &[Address], block_hash: B256) -> Result<Vec<U256>> {
        let params = addrs
            .iter()
            .map(|addr| json!([addr, { "blockHash": block_hash }]))
            .collect();
        let results = self.batch("eth_getBalance", params).await?;
        tracing::debug!(count = results.len(), block_hash = %block_hash, "Fetched native balances");

        results
            .iter()
            .map(|value| {
                parse_hex_u256(hex_string(value)?)
                    .map_err(|e| Error::Rpc(format!("bad balance {value}: {e}")))
            })
            .collect()
    }

    async fn batch_call_contract(
        &self,
        calls: &[ContractCall],
        block_hash: B256,
    ) -> Result<Vec<Bytes>> {
        let params = calls
            .iter()
            .map(|call| json!([{ "to": call.to, "data": call.data }, { "blockHash": block_hash }]))
            .collect();
        let results = self.batch("eth_call", params).await?;

        results
            .into_iter()
            .map(|value| Ok(serde_json::from_value::<Bytes>(value)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_address_formatting() {
        let addr = address!("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb");
        assert_eq!(json!(addr), json!("0x0742d35cc6634c0532925a3b844bc9e7595f0beb"));
    }

    #[test]
    fn test_block_tag() {
        assert_eq!(block_tag(Some(100)), "0x64");
        assert_eq!(block_tag(None), "latest");
    }

    #[test]
    fn test_extract_result() {
        let ok = json!({"jsonrpc": "2.0", "id": 1, "result": "0x1"});
        assert_eq!(extract_result("eth_test", ok).unwrap(), json!("0x1"));

        let null = json!({"jsonrpc": "2.0", "id": 1, "result": null});
        assert!(extract_result("eth_test", null).unwrap().is_null());

        let err = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "boom"}});
        assert!(matches!(extract_result("eth_test", err), Err(Error::Rpc(msg)) if msg.contains("boom")));

        let missing = json!({"jsonrpc": "2.0", "id": 1});
        assert!(extract_result("eth_test", missing).is_err());
    }

    #[test]
    fn test_call_params_shape() {
        let call = ContractCall::balance_of(
            address!("00000000000000000000000000000000000000c3"),
            address!("00000000000000000000000000000000000000a1"),
        );
        let params = json!([{ "to": call.to, "data": call.data }, { "blockHash": B256::ZERO }]);
        let data = params[0]["data"].as_str().unwrap();
        assert!(data.starts_with("0x70a08231"));
        assert_eq!(data.len(), 2 + 72);
    }
}
