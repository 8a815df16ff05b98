use std::collections::BTreeMap;

use crate::config::{CREATE_CONTRACT, FEE_CALL, FEE_CREATE, FEE_EXECUTE};
use crate::crypto::{create_contract, Address};
use crate::error::ChainError;
use crate::state::StateStore;
use crate::types::Transaction;
use crate::validation::validate_nonce;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeCmd {
    Execute,
    Create,
    Call,
}

impl FeeCmd {
    fn rate(self) -> u64 {
        match self {
            FeeCmd::Execute => FEE_EXECUTE,
            FeeCmd::Create => FEE_CREATE,
            FeeCmd::Call => FEE_CALL,
        }
    }
}

/// Per-transaction execution context: fee meter, resolved code, and the
/// result fields the receipt is written from.
pub struct ExecuteContext {
    pub index: u64,
    pub txbase: Address,
    pub to: Address,
    pub value: u64,
    pub limited: u64,
    pub nonce: u64,
    pub tx_type: String,
    paid: u64,
    code: Vec<u8>,
    message: String,
    create_address: Address,
    error: String,
    state: BTreeMap<String, String>,
}

impl ExecuteContext {
    pub fn new(index: u64, transaction: &Transaction, nonce: u64) -> Self {
        ExecuteContext {
            index,
            txbase: transaction.sender.clone(),
            to: transaction.recipient.clone(),
            value: transaction.value,
            limited: transaction.fee,
            nonce,
            tx_type: transaction.tx_type.clone(),
            paid: 0,
            code: Vec::new(),
            message: String::new(),
            create_address: Address::empty(),
            error: String::new(),
            state: BTreeMap::new(),
        }
    }

    pub fn is_create(&self) -> bool {
        self.to.as_str() == CREATE_CONTRACT
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn paid(&self) -> u64 {
        self.paid
    }

    pub fn fee_remainder(&self) -> u64 {
        self.limited - self.paid
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn create_address(&self) -> &Address {
        &self.create_address
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    /// Charge the rate for `cmd`. On overrun the paid fee is clamped to
    /// the limit, so the receipt reports exactly the limit and the
    /// refund is zero.
    pub fn use_fee(&mut self, cmd: FeeCmd) -> Result<(), ChainError> {
        let next = self.paid + cmd.rate();
        if next > self.limited {
            self.paid = self.limited;
            return Err(ChainError::FeeLimited(format!(
                "fee limited: {}, expected consume fee: {}",
                self.limited, next
            )));
        }
        self.paid = next;
        Ok(())
    }

    pub fn set_error(&mut self, err: &ChainError) {
        self.error = err.to_string();
    }

    fn set_message(&mut self, message: String) {
        self.message = message;
    }

    fn set_code(&mut self, code: Vec<u8>) {
        self.code = code;
    }

    fn set_create_address(&mut self, address: Address) {
        self.create_address = address;
    }

    /// Contract-build probe: the message must be a JSON object carrying
    /// `is_precompiled` and `codes`. Success counts as executable; real
    /// contract semantics stay a forward-compatibility hole.
    pub fn probe_precompile(&mut self) -> bool {
        let parsed: serde_json::Value = match serde_json::from_slice(&self.code) {
            Ok(value) => value,
            Err(_) => return false,
        };
        let (Some(pre), Some(codes)) = (parsed.get("is_precompiled"), parsed.get("codes"))
        else {
            return false;
        };
        let Some(codes) = codes.as_str() else {
            return false;
        };
        self.state
            .insert("is_precompiled".to_string(), pre.to_string());
        self.state.insert("codes".to_string(), codes.to_string());
        self.code = codes.as_bytes().to_vec();
        true
    }
}

/// Drives one transaction through the state transition. Pre-debit
/// consistency lives in `validate`; everything in `apply` runs after
/// the fee debit and may be refunded by the caller on failure.
pub struct Executor;

impl Executor {
    pub fn validate(
        &self,
        state: &mut StateStore,
        context: &ExecuteContext,
        transaction: &Transaction,
    ) -> Result<(), ChainError> {
        if context.limited != transaction.fee {
            return Err(ChainError::Validation(format!(
                "execute context limited: {}, current limited: {}",
                context.limited, transaction.fee
            )));
        }
        if context.value != transaction.value {
            return Err(ChainError::Validation(format!(
                "execute context value: {}, current value: {}",
                context.value, transaction.value
            )));
        }
        if context.txbase != transaction.sender {
            return Err(ChainError::Validation(format!(
                "execute context base: {}, current sender: {}",
                context.txbase, transaction.sender
            )));
        }
        validate_nonce(context.nonce, state.get_nonce(&context.txbase)?)
    }

    fn prepare(
        &self,
        state: &mut StateStore,
        context: &mut ExecuteContext,
        transaction: &Transaction,
    ) -> Result<(), ChainError> {
        state.compute_balance(&context.txbase, -(context.limited as i128))?;
        state.increase_nonce(&context.txbase)?;
        context.use_fee(FeeCmd::Execute)?;

        if context.is_create() {
            let create_address = create_contract(&context.txbase, context.nonce);
            context.set_message(format!("{{\"create_address\":\"{}\"}}", create_address));
            context.set_code(transaction.message.as_bytes().to_vec());
            context.set_create_address(create_address);
        } else {
            let code = state.get_code(&context.to)?.unwrap_or_default();
            context.set_message(transaction.message.clone());
            context.set_code(code);
        }
        Ok(())
    }

    fn execute(
        &self,
        state: &mut StateStore,
        context: &mut ExecuteContext,
    ) -> Result<(), ChainError> {
        if context.is_create() {
            let create_address = context.create_address().clone();
            if state.get_nonce(&create_address)? != 0 {
                return Err(ChainError::Validation(format!(
                    "already contract address: {}",
                    create_address
                )));
            }
            if !context.probe_precompile() {
                return Err(ChainError::Validation(
                    "contract code build failed".to_string(),
                ));
            }
            context.use_fee(FeeCmd::Create)?;
            state.set_code(&create_address, context.code())?;
        } else if !context.code().is_empty() {
            // byte-code execution is stubbed; the call is only metered
            context.use_fee(FeeCmd::Call)?;
        } else {
            state.compute_balance(&context.txbase, -(context.value as i128))?;
            state.compute_balance(&context.to, context.value as i128)?;
        }
        state.compute_balance(&context.txbase, context.fee_remainder() as i128)?;
        Ok(())
    }

    /// Debit, transition, refund. Call only after `validate`.
    pub fn apply(
        &self,
        state: &mut StateStore,
        context: &mut ExecuteContext,
        transaction: &Transaction,
    ) -> Result<(), ChainError> {
        self.prepare(state, context, transaction)?;
        self.execute(state, context)
    }
}
