//! Double-entry ledger
//!
//! The ledger repository is the single writer of journal entries and posted
//! balances. Every entry is balanced (debits == credits within epsilon) and
//! posts atomically; idempotency keys deduplicate client retries.

pub mod models;
pub mod repository;

pub use models::{
    account_owner, bank_clearing_account, default_trading_account, entry_totals,
    fee_income_account, is_platform_account, ActorContext, BalanceRecord, JournalEntry,
    JournalLine, BALANCE_EPSILON_SCALE,
};
pub use repository::LedgerRepository;
