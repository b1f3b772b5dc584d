//! JSON-RPC ledger client
//!
//! Talks JSON-RPC 2.0 over HTTP to a ledger gateway. Parameters go as a
//! positional array; byte strings are 0x-prefixed hex and 128-bit amounts are
//! decimal strings. Transport failures map to retryable errors, while a
//! JSON-RPC error object means the ledger reverted the call.

use super::{ConfirmedState, CycleInfo, DisputeSlot, LedgerClient, RoundStatus, SubmissionReceipt};
use crate::challenge::ProofBundle;
use crate::codec::{decimal, to_hex, Address, Hash};
use crate::error::{MinerError, Result};
use crate::justification::JustificationProof;
use crate::replay::UpdateLogEntry;
use crate::skills::Skill;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<JsonRpcError>,
    #[allow(dead_code)]
    id: Option<u64>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct DecimalRaw(#[serde(with = "decimal")] u128);

pub struct JsonRpcLedgerClient {
    url: String,
    client: reqwest::Client,
    request_id: AtomicU64,
}

impl JsonRpcLedgerClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MinerError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        trace!(id, method, "Sending ledger request");

        let response = self.client.post(&self.url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MinerError::Transport(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        let body = response.bytes().await?;
        let rpc_response: JsonRpcResponse = serde_json::from_slice(&body).map_err(|e| {
            MinerError::Serialization(format!("failed to parse {} response: {}", method, e))
        })?;

        if let Some(err) = rpc_response.error {
            debug!(method, code = err.code, message = %err.message, "Ledger reverted");
            return Err(MinerError::Revert(err.message));
        }
        Ok(rpc_response.result)
    }

    async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| {
            MinerError::Serialization(format!("unexpected {} result: {}", method, e))
        })
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn chain_time(&self) -> Result<u64> {
        self.call_as("chainTime", json!([])).await
    }

    async fn active_cycle(&self) -> Result<CycleInfo> {
        self.call_as("activeCycle", json!([])).await
    }

    async fn confirmed_state(&self, cycle: u64) -> Result<ConfirmedState> {
        self.call_as("confirmedState", json!([cycle])).await
    }

    async fn skill_count(&self) -> Result<u64> {
        self.call_as("getSkillCount", json!([])).await
    }

    async fn skill(&self, skill_id: u64) -> Result<Skill> {
        self.call_as("getSkill", json!([skill_id])).await
    }

    async fn stake_of(&self, staker: &Address) -> Result<u128> {
        let DecimalRaw(stake) = self.call_as("stakeOf", json!([to_hex(staker)])).await?;
        Ok(stake)
    }

    async fn min_stake(&self) -> Result<u128> {
        let DecimalRaw(stake) = self.call_as("minStake", json!([])).await?;
        Ok(stake)
    }

    async fn log_length(&self, cycle: u64) -> Result<u64> {
        self.call_as("getReputationUpdateLogLength", json!([cycle]))
            .await
    }

    async fn log_entry(&self, cycle: u64, index: u64) -> Result<UpdateLogEntry> {
        self.call_as("getReputationUpdateLogEntry", json!([cycle, index]))
            .await
    }

    async fn dispute_round_length(&self, round: u64) -> Result<u64> {
        self.call_as("getDisputeRoundLength", json!([round])).await
    }

    async fn dispute_slot(&self, round: u64, index: u64) -> Result<DisputeSlot> {
        self.call_as("disputeRounds", json!([round, index])).await
    }

    async fn round_status(&self, round: u64) -> Result<RoundStatus> {
        self.call_as("roundStatus", json!([round])).await
    }

    async fn submit_root_hash(
        &self,
        from: &Address,
        root_hash: &Hash,
        n_nodes: u64,
        entry_index: u64,
    ) -> Result<SubmissionReceipt> {
        let params = json!([to_hex(from), to_hex(root_hash), n_nodes, entry_index]);
        self.call_as("submitRootHash", params).await
    }

    async fn confirm_new_hash(&self, from: &Address, round: u64) -> Result<()> {
        self.call("confirmNewHash", json!([to_hex(from), round]))
            .await
            .map(|_| ())
    }

    async fn invalidate_hash(&self, from: &Address, round: u64, index: u64) -> Result<()> {
        self.call("invalidateHash", json!([to_hex(from), round, index]))
            .await
            .map(|_| ())
    }

    async fn submit_justification_root_hash(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        justification_root: &Hash,
        last_leaf: Option<&JustificationProof>,
    ) -> Result<()> {
        let params = json!([
            to_hex(from),
            round,
            index,
            to_hex(justification_root),
            serde_json::to_value(last_leaf)?
        ]);
        self.call("submitJustificationRootHash", params)
            .await
            .map(|_| ())
    }

    async fn respond_to_binary_search(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        proof: &JustificationProof,
    ) -> Result<()> {
        let params = json!([to_hex(from), round, index, serde_json::to_value(proof)?]);
        self.call("respondToBinarySearchForChallenge", params)
            .await
            .map(|_| ())
    }

    async fn respond_to_challenge(
        &self,
        from: &Address,
        round: u64,
        index: u64,
        bundle: &ProofBundle,
    ) -> Result<()> {
        let params = json!([to_hex(from), round, index, serde_json::to_value(bundle)?]);
        self.call("respondToChallenge", params).await.map(|_| ())
    }
}
