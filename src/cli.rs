//! CLI implementation for indexctl
//!
//! Operator interface over the index database: manage subscriptions and
//! tokens, load contract state for historical evaluation, and query balances.
//! All commands output pretty JSON.

use crate::api::{ApiResult, BalanceApi, ErrorCode};
use crate::config::load_subscriptions;
use crate::error::OptionalExt;
use crate::records::{
    format_balance, parse_address, ContractCodeRecord, ContractRecord, Erc20Record,
    Erc20StorageRecord, Subscription,
};
use crate::store::{RocksStore, Store};
use alloy_primitives::{Address, Bytes, B256, U256};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;

/// Index database CLI tool
#[derive(Parser)]
#[command(name = "indexctl")]
#[command(about = "Manage subscriptions and query balances of the index database")]
pub struct Cli {
    /// Path to the RocksDB database directory
    #[arg(short, long, env = "INDEXER_DB_PATH", default_value = "./index_db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Subscribe an address, or every address of a subscription file
    Subscribe {
        /// Ethereum address (hex, with or without 0x prefix)
        #[arg(required_unless_present = "file")]
        address: Option<String>,
        /// Group id
        #[arg(short, long, default_value_t = 0)]
        group: u64,
        /// Subscription file (address[,group] per line)
        #[arg(short, long, conflicts_with = "address")]
        file: Option<PathBuf>,
    },
    /// List subscriptions, optionally of one group
    ListSubscriptions {
        #[arg(short, long)]
        group: Option<u64>,
        #[arg(long, default_value_t = 0)]
        page: u64,
        #[arg(long, default_value_t = 100)]
        limit: u64,
    },
    /// Register an ERC20 token; it is bootstrapped with the next indexed block
    AddErc20 {
        /// Token contract address
        address: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        decimals: Option<u8>,
    },
    /// List registered ERC20 tokens
    ListErc20,
    /// Store contract runtime code
    PutCode {
        /// Contract address
        address: String,
        /// Bytecode in hex (with or without 0x prefix)
        hex_bytecode: String,
        /// Block the code was deployed at
        #[arg(short, long, default_value_t = 0)]
        block: u64,
    },
    /// Store contract account metadata at a block
    PutContract {
        address: String,
        block: u64,
        /// Balance in hex (with or without 0x prefix)
        balance_hex: String,
        nonce: u64,
    },
    /// Store a contract storage slot value at a block
    PutStorage {
        /// Contract address
        address: String,
        /// Storage slot in hex (64 hex chars, with or without 0x prefix)
        slot: String,
        /// Value in hex (with or without 0x prefix)
        value_hex: String,
        /// Block the value was written at
        block: u64,
    },
    /// Get the indexed balance of an address
    GetBalance {
        /// Token address (0x000..0 for the native coin)
        token: String,
        address: String,
        /// Block height (defaults to the latest indexed block)
        #[arg(short, long)]
        block: Option<u64>,
    },
    /// Get the running total of a group
    GetTotal {
        token: String,
        group: u64,
        #[arg(short, long)]
        block: Option<u64>,
    },
    /// Evaluate balanceOf over persisted contract state
    EvalBalance {
        contract: String,
        holder: String,
        #[arg(short, long)]
        block: Option<u64>,
    },
    /// Get the latest indexed header
    LatestHeader,
    /// List recorded chain reorganizations
    Reorgs,
}

/// Pad an odd-length hex string with a leading zero.
fn pad_hex_string(s: &str) -> String {
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Decode a hex string with or without 0x prefix.
fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(pad_hex_string(s)).with_context(|| format!("Invalid hex: {}", s))
}

/// Parse a hex string into a 32-byte hash (B256).
fn parse_hash(s: &str) -> Result<B256> {
    let bytes = parse_hex(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("Hash must be 32 bytes (64 hex chars), got {} bytes", bytes.len());
    }
    Ok(B256::from_slice(&bytes))
}

/// Parse a hex string into a U256 value.
fn parse_u256(s: &str) -> Result<U256> {
    let bytes = parse_hex(s)?;
    if bytes.len() > 32 {
        anyhow::bail!("U256 value too large (max 32 bytes), got {} bytes", bytes.len());
    }
    Ok(U256::from_be_slice(&bytes))
}

fn address_arg(s: &str) -> Result<Address> {
    parse_address(s).with_context(|| format!("Invalid address: {}", s))
}

/// Render a query result; `NotFound` becomes `null`.
fn query_json<T: Serialize>(result: ApiResult<T>) -> Result<Value> {
    match result {
        Ok(value) => Ok(serde_json::to_value(value)?),
        Err(e) if e.code == ErrorCode::NotFound => Ok(Value::Null),
        Err(e) => Err(e.into()),
    }
}

/// Insert subscriptions one by one, skipping addresses already subscribed.
///
/// Returns the number of (added, existing) subscriptions.
pub fn register_subscriptions<S: Store + ?Sized>(
    store: &S,
    subs: &[Subscription],
) -> crate::error::Result<(usize, usize)> {
    let mut added = 0;
    let mut existing = 0;
    for sub in subs {
        match store.insert_subscriptions(std::slice::from_ref(sub)) {
            Ok(()) => added += 1,
            Err(e) if e.is_duplicate() => existing += 1,
            Err(e) => return Err(e),
        }
    }
    Ok((added, existing))
}

/// Execute one command against `store`.
pub fn execute<S: Store + ?Sized>(store: &S, command: Commands) -> Result<Value> {
    let api = BalanceApi::new(store);

    let result = match command {
        Commands::Subscribe { address, group, file } => {
            let subs = match (file, address) {
                (Some(path), _) => load_subscriptions(&path)?,
                (None, Some(address)) => vec![Subscription::new(address_arg(&address)?, group)],
                (None, None) => anyhow::bail!("Either an address or --file is required"),
            };
            let (added, existing) = register_subscriptions(store, &subs)?;
            json!({ "status": "ok", "added": added, "existing": existing })
        }
        Commands::ListSubscriptions { group, page, limit } => {
            let (subs, total) = match group {
                Some(group) => store.find_subscriptions_by_group(group, page, limit)?,
                None => store.find_subscriptions(page, limit)?,
            };
            json!({ "page": page, "total": total, "subscriptions": subs })
        }
        Commands::AddErc20 { address, name, decimals } => {
            let erc20 = Erc20Record {
                name,
                decimals,
                ..Erc20Record::new(address_arg(&address)?)
            };
            store
                .insert_erc20(&erc20)
                .with_context(|| format!("Failed to register token {}", erc20.address))?;
            json!({ "status": "ok", "erc20": erc20 })
        }
        Commands::ListErc20 => {
            json!({ "erc20": store.list_erc20()? })
        }
        Commands::PutCode { address, hex_bytecode, block } => {
            let record = ContractCodeRecord {
                address: address_arg(&address)?,
                block_number: block,
                code: Bytes::from(parse_hex(&hex_bytecode).context("Invalid hex bytecode")?),
            };
            store.insert_contract_code(&record)?;
            json!({
                "status": "ok",
                "address": record.address,
                "code_length": record.code.len(),
            })
        }
        Commands::PutContract { address, block, balance_hex, nonce } => {
            let record = ContractRecord {
                address: address_arg(&address)?,
                block_number: block,
                balance: format_balance(parse_u256(&balance_hex)?),
                nonce,
            };
            store.insert_contract(&record)?;
            json!({ "status": "ok", "contract": record })
        }
        Commands::PutStorage { address, slot, value_hex, block } => {
            let value = parse_u256(&value_hex)?;
            let record = Erc20StorageRecord {
                address: address_arg(&address)?,
                key: parse_hash(&slot)?,
                block_number: block,
                value: B256::from(value.to_be_bytes::<32>()),
            };
            store.insert_erc20_storage(std::slice::from_ref(&record))?;
            json!({ "status": "ok", "storage": record })
        }
        Commands::GetBalance { token, address, block } => {
            json!({ "balance": query_json(api.balance(&token, &address, block))? })
        }
        Commands::GetTotal { token, group, block } => {
            json!({ "total": query_json(api.total(&token, group, block))? })
        }
        Commands::EvalBalance { contract, holder, block } => {
            json!({ "balance": query_json(api.eval_balance(&contract, &holder, block))? })
        }
        Commands::LatestHeader => {
            json!({ "header": store.find_latest_header().optional()? })
        }
        Commands::Reorgs => {
            json!({ "reorgs": store.find_reorgs()? })
        }
    };

    Ok(result)
}

/// Run the CLI command and print JSON output.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = RocksStore::open(&cli.db_path)
        .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?;

    let result = execute(&store, cli.command)?;

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
