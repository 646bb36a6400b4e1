//! Recomputed-versus-credited comparison for a processed block.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::calculators::Payout;
use crate::database::{Amount, BlockId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    CountMismatch,
    MissingPayout,
    AmountMismatch,
    UnexpectedPayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutDiscrepancy {
    pub kind: DiscrepancyKind,
    /// Unset for block-level discrepancies.
    pub user_id: Option<UserId>,
    pub expected: Amount,
    pub actual: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutValidation {
    pub block_id: BlockId,
    pub is_valid: bool,
    pub expected_payouts: Vec<Payout>,
    pub actual_payouts: Vec<Payout>,
    pub discrepancies: Vec<PayoutDiscrepancy>,
}

fn per_user(payouts: &[Payout]) -> BTreeMap<UserId, Amount> {
    let mut totals = BTreeMap::new();
    for payout in payouts {
        let total: &mut Amount = totals.entry(payout.user_id).or_insert(0);
        *total = total.saturating_add(payout.amount);
    }
    totals
}

/// Compares what a block should have paid with what it did pay, user by user.
pub fn compare_payouts(block_id: BlockId, expected: Vec<Payout>, actual: Vec<Payout>) -> PayoutValidation {
    let mut discrepancies = Vec::new();

    if expected.len() != actual.len() {
        discrepancies.push(PayoutDiscrepancy {
            kind: DiscrepancyKind::CountMismatch,
            user_id: None,
            expected: expected.len() as Amount,
            actual: actual.len() as Amount,
        });
    }

    let expected_by_user = per_user(&expected);
    let actual_by_user = per_user(&actual);

    for (&user_id, &want) in &expected_by_user {
        match actual_by_user.get(&user_id) {
            None => discrepancies.push(PayoutDiscrepancy {
                kind: DiscrepancyKind::MissingPayout,
                user_id: Some(user_id),
                expected: want,
                actual: 0,
            }),
            Some(&got) if got != want => discrepancies.push(PayoutDiscrepancy {
                kind: DiscrepancyKind::AmountMismatch,
                user_id: Some(user_id),
                expected: want,
                actual: got,
            }),
            Some(_) => {}
        }
    }
    for (&user_id, &got) in &actual_by_user {
        if !expected_by_user.contains_key(&user_id) {
            discrepancies.push(PayoutDiscrepancy {
                kind: DiscrepancyKind::UnexpectedPayout,
                user_id: Some(user_id),
                expected: 0,
                actual: got,
            });
        }
    }

    PayoutValidation {
        block_id,
        is_valid: discrepancies.is_empty(),
        expected_payouts: expected,
        actual_payouts: actual,
        discrepancies,
    }
}
