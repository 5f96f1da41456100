//! Point-in-time treasury balance reader.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use treasury_chain::{BlockTag, EvmClient};

use crate::types::Asset;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasurySnapshot {
    pub wallet_address: String,
    pub block_number: u64,
    pub block_hash: String,
    pub block_timestamp: i64,
    /// Absent if the finalized block read failed (tolerated.).
    pub finalized_block_number: Option<u64>,
    pub balances: Vec<AssetBalanceSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalanceSnapshot {
    pub asset_id: String,
    pub minor_units: BigInt,
}

pub struct TreasuryReader<'a> {
    chain: &'a dyn EvmClient,
    assets: &'a [Asset],
}

impl<'a> TreasuryReader<'a> {
    pub fn new(chain: &'a dyn EvmClient, assets: &'a [Asset]) -> Self {
        Self { chain, assets }
    }

    pub async fn read(&self) -> treasury_chain::Result<TreasurySnapshot> {
        let block = self
            .chain
            .get_block(BlockTag::Latest)
            .await?
            .ok_or_else(|| treasury_chain::ChainError::OperationFailed("latest block missing".to_string()))?;

        let finalized_block_number = match self.chain.get_block(BlockTag::Finalized).await {
            Ok(Some(b)) => Some(b.number),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "finalized block read failed, recording null");
                None
            }
        };

        let mut balances = Vec::with_capacity(self.assets.len());
        for asset in self.assets {
            let minor_units = self.read_asset_balance(asset).await;
            balances.push(AssetBalanceSnapshot {
                asset_id: asset.id.clone(),
                minor_units,
            });
        }

        Ok(TreasurySnapshot {
            wallet_address: self.chain.vault_address().to_string(),
            block_number: block.number,
            block_hash: block.hash,
            block_timestamp: block.timestamp,
            finalized_block_number,
            balances,
        })
    }

    /// Never propagates a per-asset failure: a bad token config or a
    /// transient RPC error yields a zero balance with a warning, per spec
    /// §4.7's "never throws due to a single asset" rule.
    async fn read_asset_balance(&self, asset: &Asset) -> BigInt {
        let vault = self.chain.vault_address().to_string();
        if asset.is_native() {
            return match self.chain.get_balance(&vault).await {
                Ok(bal) => bal,
                Err(err) => {
                    tracing::warn!(asset = %asset.id, error = %err, "native balance read failed");
                    BigInt::from(0)
                }
            };
        }

        let Some(token_address) = asset.token_address.as_deref() else {
            tracing::warn!(asset = %asset.id, "token asset missing address, recording zero");
            return BigInt::from(0);
        };

        match self.chain.get_bytecode(token_address).await {
            Ok(code) if code.is_empty() => {
                tracing::warn!(asset = %asset.id, address = %token_address, "no bytecode at token address, recording zero");
                return BigInt::from(0);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(asset = %asset.id, error = %err, "bytecode read failed, recording zero");
                return BigInt::from(0);
            }
        }

        match self.chain.read_erc20_balance(token_address, &vault).await {
            Ok(bal) => bal,
            Err(err) => {
                tracing::warn!(asset = %asset.id, error = %err, "token balance read failed");
                BigInt::from(0)
            }
        }
    }
}

impl TreasurySnapshot {
    pub fn balance_of(&self, asset_id: &str) -> BigInt {
        self.balances
            .iter()
            .find(|b| b.asset_id == asset_id)
            .map(|b| b.minor_units.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use treasury_chain::types::{BlockHeader, SendTransactionRequest, TransactionReceipt};

    struct FakeChain {
        native_balance: BigInt,
        token_balance: BigInt,
        token_has_code: AtomicBool,
    }

    #[async_trait]
    impl EvmClient for FakeChain {
        fn vault_address(&self) -> &str {
            "0xVault"
        }
        fn chain_id(&self) -> u64 {
            8453
        }
        async fn get_balance(&self, _address: &str) -> treasury_chain::Result<BigInt> {
            Ok(self.native_balance.clone())
        }
        async fn get_bytecode(&self, _address: &str) -> treasury_chain::Result<Vec<u8>> {
            Ok(if self.token_has_code.load(Ordering::SeqCst) {
                vec![0x60, 0x80]
            } else {
                vec![]
            })
        }
        async fn read_erc20_balance(&self, _token: &str, _owner: &str) -> treasury_chain::Result<BigInt> {
            Ok(self.token_balance.clone())
        }
        async fn read_erc20_allowance(
            &self,
            _token: &str,
            _owner: &str,
            _spender: &str,
        ) -> treasury_chain::Result<BigInt> {
            Ok(BigInt::from(0))
        }
        async fn get_block(&self, tag: BlockTag) -> treasury_chain::Result<Option<BlockHeader>> {
            match tag {
                BlockTag::Latest => Ok(Some(BlockHeader {
                    number: 100,
                    hash: "0xblock".to_string(),
                    timestamp: 1_700_000_000,
                })),
                BlockTag::Finalized => Ok(None),
            }
        }
        async fn get_block_number(&self) -> treasury_chain::Result<u64> {
            Ok(100)
        }
        async fn get_transaction_receipt(&self, _hash: &str) -> treasury_chain::Result<Option<TransactionReceipt>> {
            Ok(None)
        }
        async fn get_transaction(&self, _hash: &str) -> treasury_chain::Result<Option<treasury_chain::TransactionDetail>> {
            Ok(None)
        }
        async fn send_transaction(&self, _req: SendTransactionRequest) -> treasury_chain::Result<String> {
            Ok("0xtx".to_string())
        }
        async fn wait_for_transaction_receipt(&self, _hash: &str) -> treasury_chain::Result<TransactionReceipt> {
            Ok(TransactionReceipt {
                hash: "0xtx".to_string(),
                status: true,
                block_number: 100,
            })
        }
        async fn approve_erc20(&self, _token: &str, _spender: &str, _amount: &BigInt) -> treasury_chain::Result<String> {
            Ok("0xapprove".to_string())
        }
    }

    fn sample_assets() -> Vec<Asset> {
        vec![
            Asset {
                id: "eth".into(),
                kind: AssetKind::Native,
                symbol: "ETH".into(),
                token_address: None,
                decimals: 18,
                price_feed_id: "ETH".into(),
            },
            Asset {
                id: "usdc".into(),
                kind: AssetKind::Token,
                symbol: "USDC".into(),
                token_address: Some("0xUsdc".into()),
                decimals: 6,
                price_feed_id: "USDC".into(),
            },
        ]
    }

    #[tokio::test]
    async fn reads_balances_and_tolerates_missing_finalized_block() {
        let chain = FakeChain {
            native_balance: BigInt::from(2_000_000_000_000_000_000_i128),
            token_balance: BigInt::from(1_000_000),
            token_has_code: AtomicBool::new(true),
        };
        let assets = sample_assets();
        let reader = TreasuryReader::new(&chain, &assets);

        let snapshot = reader.read().await.unwrap();
        assert_eq!(snapshot.finalized_block_number, None);
        assert_eq!(snapshot.balance_of("eth"), BigInt::from(2_000_000_000_000_000_000_i128));
        assert_eq!(snapshot.balance_of("usdc"), BigInt::from(1_000_000));
    }

    #[tokio::test]
    async fn empty_bytecode_yields_zero_token_balance() {
        let chain = FakeChain {
            native_balance: BigInt::from(0),
            token_balance: BigInt::from(999_999),
            token_has_code: AtomicBool::new(false),
        };
        let assets = sample_assets();
        let reader = TreasuryReader::new(&chain, &assets);

        let snapshot = reader.read().await.unwrap();
        assert_eq!(snapshot.balance_of("usdc"), BigInt::from(0));
    }
}
