//! Simulation controller.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use cryptoledger_common::{
    parse_amount, AssetId, Result as LedgerResult, TransactionId, TransactionStatus, UserId,
};
use cryptoledger_ledger::{LedgerStore, SettlementStore, TransactionStore};
use cryptoledger_settlement::{
    EngineConfig, InMemoryAssetDirectory, InMemoryUserDirectory, LedgerReports, QuoteCache,
    RequestIntake, SettlementEngine, StaticPriceOracle, SubmitRequest,
};

use crate::accounts::AccountFactory;
use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, Expect, Scenario, ScenarioStep};

const ASSETS: [(&str, i64); 3] = [("bitcoin", 50_000), ("ethereum", 3_000), ("solana", 150)];
const KINDS: [&str; 4] = ["buy", "sell", "deposit", "withdrawal"];

/// Summary of a stress run.
#[derive(Debug, Clone)]
pub struct StressReport {
    pub transactions: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub elapsed: Duration,
}

/// Drives scenarios and stress runs against one store.
pub struct SimulationController {
    user_count: usize,
    seed: Option<u64>,
    store: Arc<dyn SettlementStore>,
    users: Arc<InMemoryUserDirectory>,
    engine: Arc<SettlementEngine>,
    intake: RequestIntake,
    reports: LedgerReports,
    metrics: Arc<RwLock<SimulationMetrics>>,
    labels: RwLock<HashMap<String, TransactionId>>,
}

impl SimulationController {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        config: EngineConfig,
        user_count: usize,
        seed: Option<u64>,
    ) -> Self {
        let users = Arc::new(InMemoryUserDirectory::new());
        let assets = Arc::new(InMemoryAssetDirectory::with_defaults());

        let oracle = Arc::new(StaticPriceOracle::new());
        for (asset, price) in ASSETS {
            oracle.set_price(asset, Decimal::from(price));
        }
        let quotes = Arc::new(QuoteCache::new(oracle, config.quote_ttl));

        let engine = Arc::new(SettlementEngine::new(store.clone(), config.clone()));
        let intake = RequestIntake::new(store.clone(), users.clone(), assets, config.clone())
            .with_quotes(quotes)
            .with_metrics(engine.metrics().clone());
        let reports = LedgerReports::new(store.clone(), config);

        Self {
            user_count,
            seed,
            store,
            users,
            engine,
            intake,
            reports,
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            labels: RwLock::new(HashMap::new()),
        }
    }

    /// Register simulated users and open their cash accounts.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!("Initializing simulation with {} users", self.user_count);

        for user in AccountFactory::create_users(self.user_count) {
            self.store.open_account(&user.id).await?;
            info!(user = %user.id, name = %user.name, admin = user.is_admin(), "Account opened");
            self.users.add(user);
        }

        Ok(())
    }

    /// Run a scenario, failing on the first unmet expectation.
    pub async fn run_scenario(&self, scenario: &Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);
        self.labels.write().await.clear();

        for (index, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .with_context(|| format!("scenario {} step {}", scenario.name, index + 1))?;
        }

        info!("Scenario {} passed", scenario.name);
        Ok(())
    }

    async fn execute_step(&self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::SeedHolding { user, asset, amount } => {
                let amount = parse_amount(amount, "amount")?;
                self.store
                    .adjust_holding(&UserId::new(user.as_str()), &AssetId::new(asset.as_str()), amount)
                    .await?;
            }
            ScenarioStep::SeedCash { user, amount } => {
                let amount = parse_amount(amount, "amount")?;
                self.store
                    .adjust_balance(&UserId::new(user.as_str()), amount)
                    .await?;
            }
            ScenarioStep::Submit {
                label,
                user,
                kind,
                asset,
                amount,
                price,
            } => {
                let transaction = self
                    .intake
                    .submit(SubmitRequest {
                        user_id: user.clone(),
                        asset_id: asset.clone(),
                        transaction_type: kind.clone(),
                        amount: amount.clone(),
                        price: price.clone(),
                        wallet: String::new(),
                    })
                    .await?;
                self.labels.write().await.insert(label.clone(), transaction.id);
            }
            ScenarioStep::Approve { label, expect } => {
                let id = self.label(label).await?;
                let started = Instant::now();
                let result = self.engine.approve(id).await.map(|_| ());
                self.record(&result, started).await;
                check_expect(label, &result, expect)?;
            }
            ScenarioStep::Cancel {
                label,
                reason,
                expect,
            } => {
                let id = self.label(label).await?;
                let started = Instant::now();
                let result = self.engine.cancel_with_reason(id, reason.as_deref()).await;
                self.record(&result, started).await;
                check_expect(label, &result, expect)?;
            }
            ScenarioStep::ApproveConcurrently { label, callers } => {
                let id = self.label(label).await?;
                let results = self.race_approvals(id, *callers).await?;
                let successes = results.iter().filter(|r| r.is_ok()).count();
                if successes != 1 {
                    bail!("{} concurrent approvals of {} produced {} successes", callers, label, successes);
                }
            }
            ScenarioStep::Assert { condition } => self.check(condition).await?,
        }

        Ok(())
    }

    async fn race_approvals(
        &self,
        id: TransactionId,
        callers: usize,
    ) -> anyhow::Result<Vec<LedgerResult<()>>> {
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    (engine.approve(id).await.map(|_| ()), started)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(callers);
        for joined in futures::future::join_all(handles).await {
            let (result, started) = joined?;
            self.record(&result, started).await;
            results.push(result);
        }
        Ok(results)
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::HoldingEquals { user, asset, amount } => {
                let expected = parse_amount(amount, "amount")?;
                let actual = self
                    .store
                    .get_holding(&UserId::new(user.as_str()), &AssetId::new(asset.as_str()))
                    .await?;
                if actual != expected {
                    bail!("{} {} holding is {}, expected {}", user, asset, actual, expected);
                }
            }
            AssertCondition::CashEquals { user, amount } => {
                let expected = parse_amount(amount, "amount")?;
                let actual = self.reports.cash_balance(&UserId::new(user.as_str())).await?;
                if actual != expected {
                    bail!("{} cash is {}, expected {}", user, actual, expected);
                }
            }
            AssertCondition::StatusEquals { label, status } => {
                let expected = TransactionStatus::from_str(status).map_err(|e| anyhow!(e))?;
                let actual = self.store.get(self.label(label).await?).await?.status;
                if actual != expected {
                    bail!("{} is {}, expected {}", label, actual, expected);
                }
            }
        }
        Ok(())
    }

    async fn label(&self, label: &str) -> anyhow::Result<TransactionId> {
        self.labels
            .read()
            .await
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("no transaction labelled {}", label))
    }

    async fn record(&self, result: &LedgerResult<()>, started: Instant) {
        let mut metrics = self.metrics.write().await;
        match result {
            Ok(()) => metrics.record_success(started.elapsed().as_micros() as u64),
            Err(e) => metrics.record_failure(e.error_code()),
        }
    }

    /// Submit `transactions` random requests, then let `approvers` tasks race
    /// to decide each one. Fails if any transaction settled more than once.
    pub async fn run_stress(&self, transactions: usize, approvers: usize) -> anyhow::Result<StressReport> {
        let mut rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let customers: Vec<UserId> = (1..=self.user_count)
            .map(|i| UserId::new(format!("user-{}", i)))
            .collect();
        if customers.is_empty() {
            bail!("stress run needs at least one user");
        }

        for user in &customers {
            for (asset, _) in ASSETS {
                let amount = Decimal::new(rng.gen_range(0..500), 2);
                self.store.adjust_holding(user, &AssetId::new(asset), amount).await?;
            }
        }

        let mut ids = Vec::with_capacity(transactions);
        for _ in 0..transactions {
            let user = &customers[rng.gen_range(0..customers.len())];
            let (asset, price) = ASSETS[rng.gen_range(0..ASSETS.len())];
            let kind = KINDS[rng.gen_range(0..KINDS.len())];
            let amount = Decimal::new(rng.gen_range(1..200), 2).to_string();

            let transaction = if rng.gen_bool(0.5) {
                self.intake
                    .submit_at_market(user.as_str(), asset, kind, &amount, "")
                    .await?
            } else {
                self.intake
                    .submit(SubmitRequest {
                        user_id: user.to_string(),
                        asset_id: asset.to_string(),
                        transaction_type: kind.to_string(),
                        amount,
                        price: price.to_string(),
                        wallet: String::new(),
                    })
                    .await?
            };
            ids.push(transaction.id);
        }

        info!(transactions = ids.len(), approvers, "Racing decisions");
        let started = Instant::now();

        let mut handles = Vec::with_capacity(ids.len() * approvers.max(1));
        for id in &ids {
            let cancel_slot = if rng.gen_bool(0.2) {
                Some(rng.gen_range(0..approvers.max(1)))
            } else {
                None
            };
            for slot in 0..approvers.max(1) {
                let engine = self.engine.clone();
                let id = *id;
                let cancel = cancel_slot == Some(slot);
                handles.push(tokio::spawn(async move {
                    let begun = Instant::now();
                    let result = if cancel {
                        engine.cancel_with_reason(id, Some("stress run")).await
                    } else {
                        engine.approve(id).await.map(|_| ())
                    };
                    (id, result, begun)
                }));
            }
        }

        let mut wins: HashMap<TransactionId, usize> = HashMap::new();
        for joined in futures::future::join_all(handles).await {
            let (id, result, begun) = joined?;
            self.record(&result, begun).await;
            if result.is_ok() {
                *wins.entry(id).or_default() += 1;
            }
        }
        let elapsed = started.elapsed();

        let mut report = StressReport {
            transactions: ids.len(),
            completed: 0,
            cancelled: 0,
            pending: 0,
            elapsed,
        };
        for id in &ids {
            let status = self.store.get(*id).await?.status;
            let won = wins.get(id).copied().unwrap_or(0);
            match status {
                TransactionStatus::Completed => report.completed += 1,
                TransactionStatus::Cancelled => report.cancelled += 1,
                TransactionStatus::Pending => report.pending += 1,
            }
            let expected = usize::from(status.is_terminal());
            if won != expected {
                bail!("transaction {} is {} after {} successful decisions", id, status, won);
            }
        }

        for user in &customers {
            for holding in self.store.holdings(user).await? {
                if holding.amount < Decimal::ZERO {
                    bail!("{} holding of {} went negative", holding.asset_id, user);
                }
            }
        }

        if report.pending > 0 {
            warn!(pending = report.pending, "Some transactions stayed pending for lack of funds");
        }
        Ok(report)
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    pub fn engine(&self) -> &SettlementEngine {
        &self.engine
    }

    pub fn reports(&self) -> &LedgerReports {
        &self.reports
    }
}

fn check_expect(label: &str, result: &LedgerResult<()>, expect: &Expect) -> anyhow::Result<()> {
    match (result, expect) {
        (Ok(()), Expect::Success) => Ok(()),
        (Err(e), Expect::Error(code)) if e.error_code() == code => Ok(()),
        (Ok(()), Expect::Error(code)) => bail!("{} succeeded, expected {}", label, code),
        (Err(e), _) => bail!("{} failed with {}: {}", label, e.error_code(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoledger_ledger::MemoryStore;

    async fn controller(seed: u64) -> SimulationController {
        let controller = SimulationController::new(
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
            4,
            Some(seed),
        );
        controller.initialize().await.unwrap();
        controller
    }

    #[tokio::test]
    async fn test_builtin_scenarios_pass() {
        for scenario in Scenario::all() {
            let controller = controller(7).await;
            controller.run_scenario(&scenario).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_expectation_is_reported() {
        let controller = controller(7).await;
        let scenario = Scenario {
            name: "wrong".to_string(),
            description: "expects a sell without holdings to succeed".to_string(),
            steps: vec![
                ScenarioStep::Submit {
                    label: "sell".to_string(),
                    user: "user-1".to_string(),
                    kind: "sell".to_string(),
                    asset: "bitcoin".to_string(),
                    amount: "1".to_string(),
                    price: "100".to_string(),
                },
                ScenarioStep::Approve {
                    label: "sell".to_string(),
                    expect: Expect::Success,
                },
            ],
        };
        assert!(controller.run_scenario(&scenario).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stress_settles_each_once() {
        let controller = controller(42).await;
        let report = controller.run_stress(40, 4).await.unwrap();

        assert_eq!(report.transactions, 40);
        assert_eq!(report.completed + report.cancelled + report.pending, 40);

        let metrics = controller.metrics().await;
        assert_eq!(metrics.total_decisions, 160);
        assert_eq!(
            metrics.successful_decisions as usize,
            report.completed + report.cancelled
        );
        assert_eq!(controller.engine().metrics().snapshot().submitted, 40);
    }
}
