//! Transaction and balance-change classification.
//!
//! Classification is total: every input maps to a variant, with `Other` and
//! `Unknown` as the fallback arms. It must never block or fail the pipeline.

use {
    rust_decimal::Decimal,
    std::collections::HashSet,
    solwatch_common::types::{BalanceChangeType, TransactionRecord, TransactionType},
};

pub const SYSTEM_PROGRAM: &str = "11111111111111111111111111111111";
pub const TOKEN_PROGRAM: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const ASSOCIATED_TOKEN_PROGRAM: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";
pub const VOTE_PROGRAM: &str = "Vote111111111111111111111111111111111111111";
pub const STAKE_PROGRAM: &str = "Stake11111111111111111111111111111111111111";

pub struct Classifier {
    /// Program ids whose presence marks a transaction as a swap. Membership
    /// is configuration (`SOLWATCH_SWAP_PROGRAMS`), not hard-coded logic.
    swap_programs: HashSet<String>,
}

impl Classifier {
    pub fn new(swap_programs: impl IntoIterator<Item = String>) -> Self {
        Self { swap_programs: swap_programs.into_iter().collect() }
    }

    pub fn is_swap_program(&self, program_id: &str) -> bool {
        self.swap_programs.contains(program_id)
    }

    /// Deterministic mapping from a transaction's program set and log
    /// instruction names to a transaction type. Precedence, first match wins:
    /// vote program, configured swap programs, stake program, close-account
    /// instruction, create-account instruction or ATA program, transfer
    /// instruction, system/token-only program set, `Other`.
    pub fn classify_transaction(&self, record: &TransactionRecord) -> TransactionType {
        let programs = &record.program_ids;

        if programs.iter().any(|p| p == VOTE_PROGRAM) {
            return TransactionType::Vote;
        }
        if programs.iter().any(|p| self.is_swap_program(p)) {
            return TransactionType::Swap;
        }
        if programs.iter().any(|p| p == STAKE_PROGRAM) {
            return TransactionType::Stake;
        }
        if has_instruction(&record.log_messages, &["CloseAccount"]) {
            return TransactionType::CloseAccount;
        }
        if programs.iter().any(|p| p == ASSOCIATED_TOKEN_PROGRAM)
            || has_instruction(
                &record.log_messages,
                &["CreateAccount", "InitializeAccount", "CreateIdempotent"],
            )
        {
            return TransactionType::CreateAccount;
        }
        if has_instruction(&record.log_messages, &["Transfer", "TransferChecked"]) {
            return TransactionType::Transfer;
        }
        if !programs.is_empty()
            && programs.iter().all(|p| p == SYSTEM_PROGRAM || p == TOKEN_PROGRAM)
        {
            // System or token program alone moves lamports/tokens.
            return TransactionType::Transfer;
        }

        TransactionType::Other
    }

    /// Classify a detected balance delta, optionally informed by the type of
    /// the transaction linked to the snapshot.
    pub fn classify_balance_change(
        &self,
        change: Decimal,
        linked: Option<TransactionType>,
    ) -> BalanceChangeType {
        match linked {
            Some(TransactionType::Swap) => {
                if change > Decimal::ZERO {
                    BalanceChangeType::SwapIn
                } else if change < Decimal::ZERO {
                    BalanceChangeType::SwapOut
                } else {
                    BalanceChangeType::Unknown
                }
            }
            Some(TransactionType::Transfer) => BalanceChangeType::Transfer,
            _ => {
                if change > Decimal::ZERO {
                    BalanceChangeType::Increase
                } else if change < Decimal::ZERO {
                    BalanceChangeType::Decrease
                } else {
                    BalanceChangeType::Unknown
                }
            }
        }
    }
}

fn has_instruction(logs: &[String], names: &[&str]) -> bool {
    logs.iter().any(|line| {
        names
            .iter()
            .any(|name| line.contains(&format!("Instruction: {}", name)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use solwatch_common::config::DEFAULT_SWAP_PROGRAMS;

    fn classifier() -> Classifier {
        Classifier::new(DEFAULT_SWAP_PROGRAMS.iter().map(|s| s.to_string()))
    }

    fn record(program_ids: Vec<&str>, logs: Vec<&str>) -> TransactionRecord {
        TransactionRecord {
            signature: "SIG".into(),
            slot: 1,
            block_time: None,
            success: true,
            error_message: None,
            program_ids: program_ids.into_iter().map(String::from).collect(),
            log_messages: logs.into_iter().map(String::from).collect(),
            account_keys: vec!["K1".into()],
        }
    }

    #[test]
    fn maps_program_ids_to_types() {
        let c = classifier();
        assert_eq!(
            c.classify_transaction(&record(vec![VOTE_PROGRAM], vec![])),
            TransactionType::Vote
        );
        assert_eq!(
            c.classify_transaction(&record(vec![STAKE_PROGRAM], vec![])),
            TransactionType::Stake
        );
        assert_eq!(
            c.classify_transaction(&record(
                vec!["JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4"],
                vec![]
            )),
            TransactionType::Swap
        );
        assert_eq!(
            c.classify_transaction(&record(vec![SYSTEM_PROGRAM], vec![])),
            TransactionType::Transfer
        );
    }

    #[test]
    fn instruction_logs_refine_classification() {
        let c = classifier();
        assert_eq!(
            c.classify_transaction(&record(
                vec![TOKEN_PROGRAM],
                vec!["Program log: Instruction: CloseAccount"]
            )),
            TransactionType::CloseAccount
        );
        assert_eq!(
            c.classify_transaction(&record(
                vec![ASSOCIATED_TOKEN_PROGRAM, TOKEN_PROGRAM],
                vec![]
            )),
            TransactionType::CreateAccount
        );
        assert_eq!(
            c.classify_transaction(&record(
                vec!["SomeDefiProgram"],
                vec!["Program log: Instruction: TransferChecked"]
            )),
            TransactionType::Transfer
        );
    }

    #[test]
    fn unmatched_programs_fall_back_to_other() {
        let c = classifier();
        assert_eq!(
            c.classify_transaction(&record(vec!["UnknownProgram111"], vec![])),
            TransactionType::Other
        );
        assert_eq!(
            c.classify_transaction(&record(vec![], vec![])),
            TransactionType::Other
        );
    }

    #[test]
    fn swap_precedence_beats_transfer_logs() {
        let c = classifier();
        let r = record(
            vec!["JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", TOKEN_PROGRAM],
            vec!["Program log: Instruction: Transfer"],
        );
        assert_eq!(c.classify_transaction(&r), TransactionType::Swap);
    }

    #[test]
    fn balance_change_uses_linked_transaction_type() {
        let c = classifier();
        assert_eq!(
            c.classify_balance_change(Decimal::from(50), Some(TransactionType::Swap)),
            BalanceChangeType::SwapIn
        );
        assert_eq!(
            c.classify_balance_change(Decimal::from(-50), Some(TransactionType::Swap)),
            BalanceChangeType::SwapOut
        );
        assert_eq!(
            c.classify_balance_change(Decimal::from(-10), Some(TransactionType::Transfer)),
            BalanceChangeType::Transfer
        );
        assert_eq!(
            c.classify_balance_change(Decimal::from(10), None),
            BalanceChangeType::Increase
        );
        assert_eq!(
            c.classify_balance_change(Decimal::from(-10), Some(TransactionType::Other)),
            BalanceChangeType::Decrease
        );
        assert_eq!(
            c.classify_balance_change(Decimal::ZERO, None),
            BalanceChangeType::Unknown
        );
    }
}
