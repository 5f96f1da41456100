//! External collaborator capabilities treated as black boxes by the core:
//! the EVM client, the quote aggregator, the price oracle, and ERC-191
//! canonical-message signing.

pub mod aggregator;
pub mod error;
pub mod evm;
pub mod price_oracle;
pub mod signing;
pub mod types;

pub use aggregator::{AggregatorClient, HttpAggregatorClient, QuoteRequest, NATIVE_SENTINEL_ADDRESS};
pub use error::{ChainError, Result};
pub use evm::{decode_hex_0x, derive_address_from_key, encode_erc20_transfer, BlockTag, EvmClient, JsonRpcEvmClient};
pub use price_oracle::{CoinbasePriceOracle, PriceOracleClient};
pub use types::{AggregatorQuote, BlockHeader, SendTransactionRequest, TransactionDetail, TransactionReceipt};
