//! EVM client capability: reads and writes against the target
//! L2, behind a trait so the core never depends on a concrete RPC stack.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Eip1559TransactionRequest, TransactionRequest, H256, U256,
};
use num_bigint::BigInt;
use num_traits::Num;

use crate::error::{ChainError, Result};
use crate::types::{BlockHeader, SendTransactionRequest, TransactionDetail, TransactionReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Finalized,
}

#[async_trait]
pub trait EvmClient: Send + Sync {
    fn vault_address(&self) -> &str;
    fn chain_id(&self) -> u64;

    async fn get_balance(&self, address: &str) -> Result<BigInt>;
    async fn get_bytecode(&self, address: &str) -> Result<Vec<u8>>;
    async fn read_erc20_balance(&self, token: &str, owner: &str) -> Result<BigInt>;
    async fn get_block(&self, tag: BlockTag) -> Result<Option<BlockHeader>>;
    async fn get_block_number(&self) -> Result<u64>;
    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<TransactionReceipt>>;
    /// Joins `eth_getTransactionByHash` with its receipt and the current
    /// block height, for callers that must validate a transaction's
    /// contents rather than just its outcome. `None` if the hash is
    /// unknown to the node.
    async fn get_transaction(&self, hash: &str) -> Result<Option<TransactionDetail>>;

    /// Submits a raw value/data transfer from the vault's signing key.
    async fn send_transaction(&self, req: SendTransactionRequest) -> Result<String>;
    async fn wait_for_transaction_receipt(&self, hash: &str) -> Result<TransactionReceipt>;
    async fn approve_erc20(&self, token: &str, spender: &str, amount: &BigInt) -> Result<String>;
    async fn read_erc20_allowance(&self, token: &str, owner: &str, spender: &str) -> Result<BigInt>;
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|_| ChainError::InvalidAddress(s.to_string()))
}

fn bigint_to_u256(value: &BigInt) -> Result<U256> {
    let (sign, digits) = value.to_radix_be(16);
    if sign == num_bigint::Sign::Minus {
        return Err(ChainError::OperationFailed("negative amount cannot be encoded as U256".to_string()));
    }
    let hex: String = digits.iter().map(|d| format!("{d:x}")).collect();
    U256::from_str_radix(if hex.is_empty() { "0" } else { &hex }, 16)
        .map_err(|e| ChainError::OperationFailed(format!("amount overflow: {e}")))
}

fn u256_to_bigint(value: U256) -> BigInt {
    BigInt::from_str_radix(&format!("{value:x}"), 16).unwrap_or_default()
}

/// `balanceOf(address)` selector + 32-byte padded argument.
fn encode_balance_of(owner: Address) -> Bytes {
    let mut data = vec![0x70, 0xa0, 0x82, 0x31];
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(owner.as_bytes());
    Bytes::from(data)
}

/// `approve(address,uint256)` selector + arguments.
fn encode_approve(spender: Address, amount: U256) -> Bytes {
    let mut data = vec![0x09, 0x5e, 0xa7, 0xb3];
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(spender.as_bytes());
    let mut amount_bytes = [0u8; 32];
    amount.to_big_endian(&mut amount_bytes);
    data.extend_from_slice(&amount_bytes);
    Bytes::from(data)
}

/// `allowance(address,address)` selector + arguments.
fn encode_allowance(owner: Address, spender: Address) -> Bytes {
    let mut data = vec![0xdd, 0x62, 0xed, 0x3e];
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(owner.as_bytes());
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(spender.as_bytes());
    Bytes::from(data)
}

/// `transfer(address,uint256)` selector + arguments.
fn encode_transfer(to: Address, amount: U256) -> Bytes {
    let mut data = vec![0xa9, 0x05, 0x9c, 0xbb];
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to.as_bytes());
    let mut amount_bytes = [0u8; 32];
    amount.to_big_endian(&mut amount_bytes);
    data.extend_from_slice(&amount_bytes);
    Bytes::from(data)
}

/// Derives the checksummed address a signing key controls, without
/// building a full client. Used by callers that need to warn on a
/// mismatch against a configured override before constructing the client.
pub fn derive_address_from_key(signing_key_hex: &str) -> Result<String> {
    let wallet: LocalWallet = signing_key_hex
        .parse::<LocalWallet>()
        .map_err(|e| ChainError::SigningKey(e.to_string()))?;
    Ok(format!("{:#x}", wallet.address()))
}

type SignerProvider = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Production `EvmClient` backed by a JSON-RPC provider, optionally
/// wrapped with the vault's signing key for the write path.
pub struct JsonRpcEvmClient {
    provider: Provider<Http>,
    signer: Option<Arc<SignerProvider>>,
    vault_address: Address,
    vault_address_str: String,
    chain_id: u64,
}

impl JsonRpcEvmClient {
    pub fn read_only(rpc_url: &str, chain_id: u64, vault_address: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ChainError::OperationFailed(format!("invalid RPC url: {e}")))?
            .interval(Duration::from_millis(200));
        let vault = parse_address(vault_address)?;
        Ok(Self {
            provider,
            signer: None,
            vault_address: vault,
            vault_address_str: format!("{vault:#x}"),
            chain_id,
        })
    }

    /// Builds a client with the vault's signing key loaded, used by the
    /// worker for the write path. `vault_address_override`, if present,
    /// must agree with the key-derived address; on mismatch
    /// the override wins but a warning is logged by the caller.
    pub fn with_signing_key(
        rpc_url: &str,
        chain_id: u64,
        signing_key_hex: &str,
        vault_address_override: Option<&str>,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ChainError::OperationFailed(format!("invalid RPC url: {e}")))?
            .interval(Duration::from_millis(200));
        let wallet: LocalWallet = signing_key_hex
            .parse::<LocalWallet>()
            .map_err(|e| ChainError::SigningKey(e.to_string()))?;
        let wallet = wallet.with_chain_id(chain_id);
        let derived = wallet.address();

        let vault_address = match vault_address_override {
            Some(raw) => parse_address(raw)?,
            None => derived,
        };

        let signer = Arc::new(SignerMiddleware::new(provider.clone(), wallet));
        Ok(Self {
            provider,
            signer: Some(signer),
            vault_address,
            vault_address_str: format!("{vault_address:#x}"),
            chain_id,
        })
    }

    fn signer(&self) -> Result<&Arc<SignerProvider>> {
        self.signer
            .as_ref()
            .ok_or_else(|| ChainError::SigningKey("no signing key configured".to_string()))
    }
}

#[async_trait]
impl EvmClient for JsonRpcEvmClient {
    fn vault_address(&self) -> &str {
        &self.vault_address_str
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_balance(&self, address: &str) -> Result<BigInt> {
        let addr = parse_address(address)?;
        let balance = self
            .provider
            .get_balance(addr, None)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_getBalance".to_string(), error: e.to_string() })?;
        Ok(u256_to_bigint(balance))
    }

    async fn get_bytecode(&self, address: &str) -> Result<Vec<u8>> {
        let addr = parse_address(address)?;
        let code = self
            .provider
            .get_code(addr, None)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_getCode".to_string(), error: e.to_string() })?;
        Ok(code.to_vec())
    }

    async fn read_erc20_balance(&self, token: &str, owner: &str) -> Result<BigInt> {
        let token_addr = parse_address(token)?;
        let owner_addr = parse_address(owner)?;
        let call = ethers::types::transaction::eip2718::TypedTransaction::Legacy(TransactionRequest {
            to: Some(token_addr.into()),
            data: Some(encode_balance_of(owner_addr)),
            ..Default::default()
        });
        let result = self
            .provider
            .call(&call, None)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_call(balanceOf)".to_string(), error: e.to_string() })?;
        Ok(u256_to_bigint(U256::from_big_endian(&result)))
    }

    async fn read_erc20_allowance(&self, token: &str, owner: &str, spender: &str) -> Result<BigInt> {
        let token_addr = parse_address(token)?;
        let owner_addr = parse_address(owner)?;
        let spender_addr = parse_address(spender)?;
        let call = ethers::types::transaction::eip2718::TypedTransaction::Legacy(TransactionRequest {
            to: Some(token_addr.into()),
            data: Some(encode_allowance(owner_addr, spender_addr)),
            ..Default::default()
        });
        let result = self
            .provider
            .call(&call, None)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_call(allowance)".to_string(), error: e.to_string() })?;
        Ok(u256_to_bigint(U256::from_big_endian(&result)))
    }

    async fn get_block(&self, tag: BlockTag) -> Result<Option<BlockHeader>> {
        let block_number = match tag {
            BlockTag::Latest => BlockNumber::Latest,
            BlockTag::Finalized => BlockNumber::Finalized,
        };
        let block = self
            .provider
            .get_block(BlockId::Number(block_number))
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_getBlockByNumber".to_string(), error: e.to_string() })?;

        Ok(block.and_then(|b| {
            Some(BlockHeader {
                number: b.number?.as_u64(),
                hash: format!("{:#x}", b.hash?),
                timestamp: b.timestamp.as_u64() as i64,
            })
        }))
    }

    async fn get_block_number(&self) -> Result<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_blockNumber".to_string(), error: e.to_string() })?;
        Ok(number.as_u64())
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<TransactionReceipt>> {
        let hash = H256::from_str(hash).map_err(|e| ChainError::OperationFailed(e.to_string()))?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_getTransactionReceipt".to_string(), error: e.to_string() })?;

        Ok(receipt.map(|r| TransactionReceipt {
            hash: format!("{:#x}", r.transaction_hash),
            status: r.status.map(|s| s == 1.into()).unwrap_or(false),
            block_number: r.block_number.map(|n| n.as_u64()).unwrap_or(0),
        }))
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<TransactionDetail>> {
        let h = H256::from_str(hash).map_err(|e| ChainError::OperationFailed(e.to_string()))?;
        let tx = self
            .provider
            .get_transaction(h)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_getTransactionByHash".to_string(), error: e.to_string() })?;
        let Some(tx) = tx else { return Ok(None) };

        let receipt = self
            .provider
            .get_transaction_receipt(h)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_getTransactionReceipt".to_string(), error: e.to_string() })?;

        let confirmations = match tx.block_number {
            Some(mined_at) => {
                let head = self
                    .provider
                    .get_block_number()
                    .await
                    .map_err(|e| ChainError::Rpc { method: "eth_blockNumber".to_string(), error: e.to_string() })?;
                head.saturating_sub(mined_at).as_u64() + 1
            }
            None => 0,
        };

        Ok(Some(TransactionDetail {
            hash: format!("{:#x}", tx.hash),
            from: format!("{:#x}", tx.from),
            to: tx.to.map(|a| format!("{a:#x}")),
            value: u256_to_bigint(tx.value),
            chain_id: tx.chain_id.map(|c| c.as_u64()),
            block_number: tx.block_number.map(|n| n.as_u64()),
            block_hash: tx.block_hash.map(|h| format!("{h:#x}")),
            confirmations,
            status: receipt.and_then(|r| r.status).map(|s| s == 1.into()),
        }))
    }

    async fn send_transaction(&self, req: SendTransactionRequest) -> Result<String> {
        let signer = self.signer()?;
        let to = parse_address(&req.to)?;
        let mut tx = Eip1559TransactionRequest::new().to(to).chain_id(self.chain_id);
        if let Some(value) = &req.value {
            tx = tx.value(bigint_to_u256(value)?);
        }
        if let Some(data) = req.data {
            tx = tx.data(Bytes::from(data));
        }
        if let Some(gas) = req.gas {
            tx = tx.gas(gas);
        }

        let pending = signer
            .send_transaction(tx, None)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_sendTransaction".to_string(), error: e.to_string() })?;
        Ok(format!("{:#x}", pending.tx_hash()))
    }

    async fn wait_for_transaction_receipt(&self, hash: &str) -> Result<TransactionReceipt> {
        let h = H256::from_str(hash).map_err(|e| ChainError::OperationFailed(e.to_string()))?;
        let receipt = self
            .provider
            .get_transaction_receipt(h)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_getTransactionReceipt".to_string(), error: e.to_string() })?
            .ok_or_else(|| ChainError::ReceiptTimeout { hash: hash.to_string() })?;

        if receipt.status != Some(1.into()) {
            return Err(ChainError::TransactionReverted(hash.to_string()));
        }

        Ok(TransactionReceipt {
            hash: format!("{:#x}", receipt.transaction_hash),
            status: true,
            block_number: receipt.block_number.map(|n| n.as_u64()).unwrap_or(0),
        })
    }

    async fn approve_erc20(&self, token: &str, spender: &str, amount: &BigInt) -> Result<String> {
        let signer = self.signer()?;
        let token_addr = parse_address(token)?;
        let spender_addr = parse_address(spender)?;
        let amount_u256 = bigint_to_u256(amount)?;

        let tx = Eip1559TransactionRequest::new()
            .to(token_addr)
            .data(encode_approve(spender_addr, amount_u256))
            .chain_id(self.chain_id);

        let pending = signer
            .send_transaction(tx, None)
            .await
            .map_err(|e| ChainError::Rpc { method: "eth_sendTransaction(approve)".to_string(), error: e.to_string() })?;
        Ok(format!("{:#x}", pending.tx_hash()))
    }
}

/// Builds ERC-20 `transfer(to, amount)` calldata for settlement token
/// payouts.
pub fn encode_erc20_transfer(to: &str, amount: &BigInt) -> Result<Vec<u8>> {
    let to_addr = parse_address(to)?;
    let amount_u256 = bigint_to_u256(amount)?;
    Ok(encode_transfer(to_addr, amount_u256).to_vec())
}

/// Decodes a `0x`-prefixed hex calldata string, as returned by the
/// aggregator's quote response.
pub fn decode_hex_0x(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(ChainError::OperationFailed(format!("odd-length hex string: {s}")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| ChainError::OperationFailed(e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigint_u256_round_trip() {
        let value = BigInt::from(123_456_789_012_345_u64);
        let u256 = bigint_to_u256(&value).unwrap();
        assert_eq!(u256_to_bigint(u256), value);
    }

    #[test]
    fn balance_of_selector_is_correct() {
        let addr = Address::zero();
        let encoded = encode_balance_of(addr);
        assert_eq!(&encoded[0..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(encoded.len(), 36);
    }
}
