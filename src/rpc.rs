//! Ethereum-JSON-RPC-flavoured [`BlockProvider`] implementation.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use jsonrpsee::{
	core::client::ClientT,
	http_client::{HttpClient, HttpClientBuilder},
	rpc_params,
};
use serde::Deserialize;

use crate::{
	provider::BlockProvider,
	types::{Block, BlockHash},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
	number: String,
	hash: String,
	parent_hash: String,
	#[serde(default)]
	transactions: Vec<serde_json::Value>,
}

fn parse_quantity(quantity: &str) -> anyhow::Result<u64> {
	u64::from_str_radix(quantity.trim_start_matches("0x"), 16)
		.with_context(|| format!("invalid hex quantity {quantity:?}"))
}

impl TryFrom<RpcBlock> for Block {
	type Error = anyhow::Error;

	fn try_from(raw: RpcBlock) -> anyhow::Result<Self> {
		Ok(Block {
			number: parse_quantity(&raw.number)?,
			hash: BlockHash::new(raw.hash),
			parent_hash: BlockHash::new(raw.parent_hash),
			transactions: raw.transactions,
		})
	}
}

#[derive(Clone)]
pub struct EthRpcClient {
	client: HttpClient,
}

impl EthRpcClient {
	pub fn new(http_endpoint: &str) -> anyhow::Result<Self> {
		Ok(EthRpcClient {
			client: HttpClientBuilder::default()
				.build(http_endpoint)
				.with_context(|| format!("failed to create HTTP client for {http_endpoint}"))?,
		})
	}
}

#[async_trait]
impl BlockProvider for EthRpcClient {
	async fn block_by_number(&self, number: u64, include_tx: bool) -> anyhow::Result<Option<Block>> {
		let block: Option<RpcBlock> = self
			.client
			.request("eth_getBlockByNumber", rpc_params![format!("0x{number:x}"), include_tx])
			.await
			.map_err(|e| anyhow!("eth_getBlockByNumber({number}) failed: {e}"))?;
		block.map(Block::try_from).transpose()
	}

	async fn block_by_hash(
		&self,
		hash: &BlockHash,
		include_tx: bool,
	) -> anyhow::Result<Option<Block>> {
		let block: Option<RpcBlock> = self
			.client
			.request("eth_getBlockByHash", rpc_params![hash.as_str(), include_tx])
			.await
			.map_err(|e| anyhow!("eth_getBlockByHash({hash}) failed: {e}"))?;
		block.map(Block::try_from).transpose()
	}

	async fn block_number(&self) -> anyhow::Result<u64> {
		let number: String = self
			.client
			.request("eth_blockNumber", rpc_params![])
			.await
			.map_err(|e| anyhow!("eth_blockNumber failed: {e}"))?;
		parse_quantity(&number)
	}
}
