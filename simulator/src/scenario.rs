//! Simulation scenarios.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Transactions are referred to by a label chosen at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Credit a holding directly, outside any transaction.
    SeedHolding {
        user: String,
        asset: String,
        amount: String,
    },
    /// Credit cash directly.
    SeedCash { user: String, amount: String },
    /// Submit a request through intake.
    Submit {
        label: String,
        user: String,
        kind: String,
        asset: String,
        amount: String,
        price: String,
    },
    /// Approve a labelled transaction.
    Approve { label: String, expect: Expect },
    /// Cancel a labelled transaction.
    Cancel {
        label: String,
        #[serde(default)]
        reason: Option<String>,
        expect: Expect,
    },
    /// Approve the same transaction from several tasks at once.
    ApproveConcurrently { label: String, callers: usize },
    /// Check a condition.
    Assert { condition: AssertCondition },
}

/// Expected result of a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    Success,
    /// Failure with this error code.
    Error(String),
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertCondition {
    HoldingEquals {
        user: String,
        asset: String,
        amount: String,
    },
    CashEquals { user: String, amount: String },
    StatusEquals { label: String, status: String },
}

impl Scenario {
    /// Load a built-in scenario by name, or a JSON scenario from a `.json` path.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        if name.ends_with(".json") {
            return Self::from_file(name);
        }
        match name {
            "sell-credit" => Ok(Self::sell_credit()),
            "withdrawal-fee" => Ok(Self::withdrawal_fee()),
            "buy-credit" => Ok(Self::buy_credit()),
            "double-approve" => Ok(Self::double_approve()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Every built-in scenario.
    pub fn all() -> Vec<Self> {
        vec![
            Self::sell_credit(),
            Self::withdrawal_fee(),
            Self::buy_credit(),
            Self::double_approve(),
        ]
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Sell 0.2 BTC at 50000 out of a 0.5 BTC holding.
    fn sell_credit() -> Self {
        Self {
            name: "sell-credit".to_string(),
            description: "Approved sell moves value from holding to cash".to_string(),
            steps: vec![
                seed_holding("user-1", "bitcoin", "0.5"),
                submit("sell", "user-1", "sell", "bitcoin", "0.2", "50000"),
                ScenarioStep::Approve {
                    label: "sell".to_string(),
                    expect: Expect::Success,
                },
                holding_equals("user-1", "bitcoin", "0.3"),
                cash_equals("user-1", "10000"),
                status_equals("sell", "completed"),
            ],
        }
    }

    /// Withdraw a whole 1.0 ETH holding; the fee cannot be covered.
    fn withdrawal_fee() -> Self {
        Self {
            name: "withdrawal-fee".to_string(),
            description: "Withdrawal whose fee exceeds the holding is rejected".to_string(),
            steps: vec![
                seed_holding("user-1", "ethereum", "1.0"),
                submit("withdraw", "user-1", "withdrawal", "ethereum", "1.0", "0"),
                ScenarioStep::Approve {
                    label: "withdraw".to_string(),
                    expect: Expect::Error("INSUFFICIENT_BALANCE".to_string()),
                },
                holding_equals("user-1", "ethereum", "1.0"),
                status_equals("withdraw", "pending"),
                ScenarioStep::Cancel {
                    label: "withdraw".to_string(),
                    reason: Some("fee not covered".to_string()),
                    expect: Expect::Success,
                },
                status_equals("withdraw", "cancelled"),
            ],
        }
    }

    /// Buy 2 units at 100; cash is settled outside the ledger.
    fn buy_credit() -> Self {
        Self {
            name: "buy-credit".to_string(),
            description: "Approved buy credits the holding and leaves cash alone".to_string(),
            steps: vec![
                ScenarioStep::SeedCash {
                    user: "user-1".to_string(),
                    amount: "500".to_string(),
                },
                submit("buy", "user-1", "buy", "solana", "2", "100"),
                ScenarioStep::Approve {
                    label: "buy".to_string(),
                    expect: Expect::Success,
                },
                holding_equals("user-1", "solana", "2"),
                cash_equals("user-1", "500"),
            ],
        }
    }

    /// Two administrators approve the same request at once.
    fn double_approve() -> Self {
        Self {
            name: "double-approve".to_string(),
            description: "Concurrent approvals settle exactly once".to_string(),
            steps: vec![
                submit("buy", "user-1", "buy", "bitcoin", "1", "50000"),
                ScenarioStep::ApproveConcurrently {
                    label: "buy".to_string(),
                    callers: 2,
                },
                holding_equals("user-1", "bitcoin", "1"),
                status_equals("buy", "completed"),
                ScenarioStep::Approve {
                    label: "buy".to_string(),
                    expect: Expect::Error("INVALID_STATE".to_string()),
                },
            ],
        }
    }
}

fn seed_holding(user: &str, asset: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::SeedHolding {
        user: user.to_string(),
        asset: asset.to_string(),
        amount: amount.to_string(),
    }
}

fn submit(label: &str, user: &str, kind: &str, asset: &str, amount: &str, price: &str) -> ScenarioStep {
    ScenarioStep::Submit {
        label: label.to_string(),
        user: user.to_string(),
        kind: kind.to_string(),
        asset: asset.to_string(),
        amount: amount.to_string(),
        price: price.to_string(),
    }
}

fn holding_equals(user: &str, asset: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::HoldingEquals {
            user: user.to_string(),
            asset: asset.to_string(),
            amount: amount.to_string(),
        },
    }
}

fn cash_equals(user: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::CashEquals {
            user: user.to_string(),
            amount: amount.to_string(),
        },
    }
}

fn status_equals(label: &str, status: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::StatusEquals {
            label: label.to_string(),
            status: status.to_string(),
        },
    }
}
