//! Historical `balanceOf` evaluation over persisted contract state
//!
//! Runs a token contract's persisted runtime code in revm against a read-only
//! database facade that only knows about that one contract: its code, its
//! account metadata and its storage cells as of a block. Any state access to
//! another account is answered with empty state and recorded, and a recorded
//! foreign access fails the evaluation with [`Error::NotSelf`].

use crate::error::{Error, OptionalExt, Result};
use crate::node::{decode_uint256, encode_balance_of};
use crate::records::parse_balance;
use crate::store::Store;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use revm::primitives::{
    AccountInfo, Address as RAddress, Bytecode, Bytes as RBytes, ExecutionResult, Output,
    ResultAndState, SpecId, TransactTo, B256 as RB256, U256 as RU256,
};
use revm::{DatabaseRef, Evm};
use std::cell::Cell;
use tracing::debug;

/// Chain id of the execution environment.
const CHAIN_ID: u64 = 1;

/// Read-only view of a single contract at a block.
struct ContractState<'a, S: ?Sized> {
    store: &'a S,
    contract: Address,
    block_number: u64,
    info: AccountInfo,
    /// Set on the first access to any other account
    not_self: Cell<bool>,
}

impl<'a, S: Store + ?Sized> ContractState<'a, S> {
    fn load(store: &'a S, contract: Address, block_number: u64) -> Result<Self> {
        let code = store.find_contract_code(contract)?.code;
        let (balance, nonce) = match store.find_contract(contract, block_number).optional()? {
            Some(meta) => (parse_balance(&meta.balance)?, meta.nonce),
            None => (U256::ZERO, 0),
        };

        let code_hash = RB256::from_slice(keccak256(&code).as_slice());
        let info = AccountInfo::new(
            RU256::from_be_bytes(balance.to_be_bytes::<32>()),
            nonce,
            code_hash,
            Bytecode::new_raw(RBytes::copy_from_slice(&code)),
        );

        Ok(Self {
            store,
            contract,
            block_number,
            info,
            not_self: Cell::new(false),
        })
    }

    fn is_self(&self, address: RAddress) -> bool {
        let is_self = address.as_slice() == self.contract.as_slice();
        if !is_self {
            self.not_self.set(true);
        }
        is_self
    }
}

impl<S: Store + ?Sized> DatabaseRef for ContractState<'_, S> {
    type Error = Error;

    fn basic_ref(&self, address: RAddress) -> Result<Option<AccountInfo>> {
        if !self.is_self(address) {
            return Ok(None);
        }
        Ok(Some(self.info.clone()))
    }

    fn code_by_hash_ref(&self, code_hash: RB256) -> Result<Bytecode> {
        if code_hash == self.info.code_hash {
            if let Some(code) = &self.info.code {
                return Ok(code.clone());
            }
        }
        self.not_self.set(true);
        Ok(Bytecode::default())
    }

    fn storage_ref(&self, address: RAddress, index: RU256) -> Result<RU256> {
        if !self.is_self(address) {
            return Ok(RU256::ZERO);
        }
        let slot = B256::from(index.to_be_bytes::<32>());
        let value = self
            .store
            .find_erc20_storage(self.contract, slot, self.block_number)
            .optional()?
            .map(|cell| cell.value)
            .unwrap_or(B256::ZERO);
        Ok(RU256::from_be_slice(value.as_slice()))
    }

    fn block_hash_ref(&self, _number: u64) -> Result<RB256> {
        Ok(RB256::ZERO)
    }
}

/// Evaluates read-only calls against persisted contract state.
pub struct BalanceEvaluator<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> BalanceEvaluator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// `contract.balanceOf(holder)` as of `block_number`.
    pub fn balance_of(&self, contract: Address, holder: Address, block_number: u64) -> Result<U256> {
        let output = self.call(contract, encode_balance_of(holder), block_number)?;
        let balance = decode_uint256(&output)?;
        debug!(%contract, %holder, block_number, %balance, "Evaluated balanceOf");
        Ok(balance)
    }

    /// Execute `calldata` against `contract` as of `block_number`.
    ///
    /// The contract calls itself and is its own block beneficiary, so a
    /// well-behaved token never causes a foreign account to be loaded.
    pub fn call(&self, contract: Address, calldata: Bytes, block_number: u64) -> Result<Bytes> {
        let state = ContractState::load(self.store, contract, block_number)?;
        let target = RAddress::from_slice(contract.as_slice());

        let result = {
            let mut evm = Evm::builder()
                .with_ref_db(&state)
                .with_spec_id(SpecId::CANCUN)
                .modify_cfg_env(|cfg| {
                    cfg.chain_id = CHAIN_ID;
                    cfg.disable_eip3607 = true;
                })
                .modify_block_env(|block| {
                    block.number = RU256::from(block_number);
                    block.coinbase = target;
                    block.gas_limit = RU256::from(u64::MAX);
                    block.basefee = RU256::ZERO;
                })
                .modify_tx_env(|tx| {
                    tx.caller = target;
                    tx.transact_to = TransactTo::Call(target);
                    tx.data = RBytes::copy_from_slice(&calldata);
                    tx.value = RU256::ZERO;
                    tx.gas_limit = u64::MAX;
                    tx.gas_price = RU256::ZERO;
                    tx.nonce = None;
                })
                .build();

            let ResultAndState { result, .. } = evm.transact().map_err(|e| match e {
                revm::primitives::EVMError::Database(db) => db,
                other => Error::Evm(format!("{other:?}")),
            })?;
            result
        };

        if state.not_self.get() {
            return Err(Error::NotSelf);
        }

        match result {
            ExecutionResult::Success {
                output: Output::Call(bytes),
                ..
            } => Ok(Bytes::copy_from_slice(&bytes)),
            ExecutionResult::Success { output, .. } => {
                Err(Error::Evm(format!("unexpected call output {output:?}")))
            }
            ExecutionResult::Revert { output, .. } => {
                Err(Error::Evm(format!("execution reverted: 0x{}", hex::encode(output))))
            }
            ExecutionResult::Halt { reason, .. } => Err(Error::Evm(format!("execution halted: {reason:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ContractCodeRecord, Erc20StorageRecord};
    use crate::store::RocksStore;
    use alloy_primitives::address;
    use tempfile::TempDir;

    const TOKEN: Address = address!("00000000000000000000000000000000000000c3");
    const HOLDER: Address = address!("00000000000000000000000000000000000000a1");

    /// Returns `balances[calldata[4..36]]` for `mapping(address => uint256) balances` at slot 0.
    const MAPPING_READER: &str = "600435600052600060205260406000205460005260206000f3";

    fn create_test_store() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn put_code(store: &RocksStore, code: Vec<u8>) {
        store
            .insert_contract_code(&ContractCodeRecord {
                address: TOKEN,
                block_number: 1,
                code: Bytes::from(code),
            })
            .unwrap();
    }

    fn balance_slot(holder: Address) -> B256 {
        let mut preimage = [0u8; 64];
        preimage[12..32].copy_from_slice(holder.as_slice());
        keccak256(preimage)
    }

    #[test]
    fn test_historical_balance_of() {
        let (store, _temp_dir) = create_test_store();
        put_code(&store, hex::decode(MAPPING_READER).unwrap());

        let one_ether = U256::from(1_000_000_000_000_000_000u128);
        store
            .insert_erc20_storage(&[Erc20StorageRecord {
                address: TOKEN,
                key: balance_slot(HOLDER),
                block_number: 100,
                value: B256::from(one_ether.to_be_bytes::<32>()),
            }])
            .unwrap();

        let evaluator = BalanceEvaluator::new(&store);
        assert_eq!(evaluator.balance_of(TOKEN, HOLDER, 100).unwrap(), one_ether);
        assert_eq!(evaluator.balance_of(TOKEN, HOLDER, 150).unwrap(), one_ether);
        assert_eq!(evaluator.balance_of(TOKEN, HOLDER, 99).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let (store, _temp_dir) = create_test_store();
        put_code(&store, hex::decode(MAPPING_READER).unwrap());
        store
            .insert_erc20_storage(&[Erc20StorageRecord {
                address: TOKEN,
                key: balance_slot(HOLDER),
                block_number: 5,
                value: B256::with_last_byte(42),
            }])
            .unwrap();

        let evaluator = BalanceEvaluator::new(&store);
        let calldata = encode_balance_of(HOLDER);
        let first = evaluator.call(TOKEN, calldata.clone(), 5).unwrap();
        let second = evaluator.call(TOKEN, calldata, 5).unwrap();
        assert_eq!(first, second);
        assert_eq!(decode_uint256(&first).unwrap(), U256::from(42u64));
    }

    #[test]
    fn test_foreign_account_access_is_not_self() {
        let (store, _temp_dir) = create_test_store();
        // PUSH20 <holder> BALANCE PUSH1 0 MSTORE PUSH1 32 PUSH1 0 RETURN
        let mut code = vec![0x73];
        code.extend_from_slice(HOLDER.as_slice());
        code.extend_from_slice(&[0x31, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3]);
        put_code(&store, code);

        let evaluator = BalanceEvaluator::new(&store);
        assert!(matches!(
            evaluator.balance_of(TOKEN, HOLDER, 10),
            Err(Error::NotSelf)
        ));
    }

    #[test]
    fn test_revert_is_error() {
        let (store, _temp_dir) = create_test_store();
        // PUSH1 0 PUSH1 0 REVERT
        put_code(&store, vec![0x60, 0x00, 0x60, 0x00, 0xfd]);

        let evaluator = BalanceEvaluator::new(&store);
        assert!(matches!(evaluator.balance_of(TOKEN, HOLDER, 10), Err(Error::Evm(_))));
    }

    #[test]
    fn test_missing_code_is_not_found() {
        let (store, _temp_dir) = create_test_store();
        let evaluator = BalanceEvaluator::new(&store);
        assert!(evaluator.balance_of(TOKEN, HOLDER, 10).unwrap_err().is_not_found());
    }
}
