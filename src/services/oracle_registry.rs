//! Oracle registry
//!
//! Maps each registered oracle to the index set the ledger assigned it.
//! Populated once at startup, then shared read-only with the dispatcher.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::error::{CoreError, LedgerError};
use crate::ledger::{bounded, Ledger};
use crate::models::{Address, Amount, IndexSet, RequestIndex};

#[derive(Debug, Clone)]
pub struct OracleRegistry {
    oracles: HashMap<Address, IndexSet>,
    call_timeout: Duration,
}

impl OracleRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            oracles: HashMap::new(),
            call_timeout,
        }
    }

    /// Registers one oracle with the ledger and records its index set.
    pub async fn register(
        &mut self,
        ledger: &dyn Ledger,
        oracle: &Address,
        fee: Amount,
    ) -> Result<IndexSet, CoreError> {
        if self.oracles.contains_key(oracle) {
            return Err(CoreError::Registration {
                oracle: oracle.clone(),
                reason: "already registered with this process".to_string(),
            });
        }

        let indexes = register_with_ledger(ledger, oracle, fee, self.call_timeout).await?;
        self.oracles.insert(oracle.clone(), indexes);
        Ok(indexes)
    }

    /// Registers a whole pool concurrently; one participant failing does not
    /// affect the others. Failures are returned alongside the registry.
    pub async fn populate(
        ledger: &dyn Ledger,
        pool: &[Address],
        fee: Amount,
        call_timeout: Duration,
    ) -> (Self, Vec<CoreError>) {
        let mut registry = Self::new(call_timeout);
        let mut failures = Vec::new();

        let mut unique = Vec::with_capacity(pool.len());
        for oracle in pool {
            if unique.contains(&oracle) {
                warn!(%oracle, "duplicate pool entry skipped");
                failures.push(CoreError::Registration {
                    oracle: oracle.clone(),
                    reason: "listed more than once in the pool".to_string(),
                });
            } else {
                unique.push(oracle);
            }
        }

        let attempts = unique.iter().map(|oracle| async move {
            let result = register_with_ledger(ledger, oracle, fee, call_timeout).await;
            ((*oracle).clone(), result)
        });

        for (oracle, result) in join_all(attempts).await {
            match result {
                Ok(indexes) => {
                    info!(%oracle, %indexes, "oracle registered");
                    registry.oracles.insert(oracle, indexes);
                }
                Err(err) => {
                    warn!(%oracle, error = %err, "oracle registration failed; continuing with the rest of the pool");
                    failures.push(err);
                }
            }
        }

        info!(
            registered = registry.len(),
            failed = failures.len(),
            "oracle pool registration complete"
        );
        (registry, failures)
    }

    pub fn index_set_of(&self, oracle: &Address) -> Option<&IndexSet> {
        self.oracles.get(oracle)
    }

    /// Oracles whose assigned set contains `index`.
    pub fn eligible_for(&self, index: RequestIndex) -> impl Iterator<Item = &Address> {
        self.oracles
            .iter()
            .filter(move |(_, indexes)| indexes.contains(index))
            .map(|(oracle, _)| oracle)
    }

    pub fn len(&self) -> usize {
        self.oracles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oracles.is_empty()
    }
}

async fn register_with_ledger(
    ledger: &dyn Ledger,
    oracle: &Address,
    fee: Amount,
    call_timeout: Duration,
) -> Result<IndexSet, CoreError> {
    let as_registration_error = |err: LedgerError| CoreError::Registration {
        oracle: oracle.clone(),
        reason: err.to_string(),
    };

    bounded(call_timeout, ledger.register_oracle(oracle, fee))
        .await
        .map_err(as_registration_error)?;

    bounded(call_timeout, ledger.assigned_indexes(oracle))
        .await
        .map_err(as_registration_error)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::ETHER;

    fn oracle(n: usize) -> Address {
        Address::derived(&format!("oracle-{n}"))
    }

    async fn ledger_with_funded(oracles: &[Address]) -> MemoryLedger {
        let ledger = MemoryLedger::new(Address::derived("owner"), Address::derived("airline-1"), 3);
        for oracle in oracles {
            ledger.deposit(oracle, 5 * ETHER).await;
        }
        ledger
    }

    #[tokio::test]
    async fn test_register_records_assigned_indexes() {
        let a = oracle(1);
        let ledger = ledger_with_funded(&[a.clone()]).await;
        ledger.preset_indexes(&a, IndexSet::new([3, 7, 9]).unwrap()).await;

        let mut registry = OracleRegistry::new(Duration::from_secs(1));
        let indexes = registry.register(&ledger, &a, ETHER).await.unwrap();

        assert_eq!(indexes.indexes(), [3, 7, 9]);
        assert_eq!(registry.index_set_of(&a), Some(&indexes));
        assert!(registry.index_set_of(&oracle(2)).is_none());
    }

    #[tokio::test]
    async fn test_failed_registration_is_not_recorded() {
        let a = oracle(1);
        let ledger = ledger_with_funded(&[]).await;

        let mut registry = OracleRegistry::new(Duration::from_secs(1));
        let err = registry.register(&ledger, &a, ETHER).await.unwrap_err();

        assert!(matches!(err, CoreError::Registration { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_refuses_known_oracle() {
        let a = oracle(1);
        let ledger = ledger_with_funded(&[a.clone()]).await;

        let mut registry = OracleRegistry::new(Duration::from_secs(1));
        let first = registry.register(&ledger, &a, ETHER).await.unwrap();
        assert!(registry.register(&ledger, &a, ETHER).await.is_err());
        assert_eq!(registry.index_set_of(&a), Some(&first));
    }

    #[tokio::test]
    async fn test_populate_isolates_individual_failures() {
        let pool: Vec<_> = (0..20).map(oracle).collect();
        // Oracle 4 and 11 have no funds to pay the fee.
        let funded: Vec<_> = pool
            .iter()
            .enumerate()
            .filter(|(n, _)| *n != 4 && *n != 11)
            .map(|(_, a)| a.clone())
            .collect();
        let ledger = ledger_with_funded(&funded).await;

        let (registry, failures) =
            OracleRegistry::populate(&ledger, &pool, ETHER, Duration::from_secs(1)).await;

        assert_eq!(registry.len(), 18);
        assert_eq!(failures.len(), 2);
        assert!(registry.index_set_of(&pool[4]).is_none());
        assert!(registry.index_set_of(&pool[5]).is_some());
    }

    #[tokio::test]
    async fn test_eligibility_is_index_membership() {
        let (a, b) = (oracle(1), oracle(2));
        let ledger = ledger_with_funded(&[a.clone(), b.clone()]).await;
        ledger.preset_indexes(&a, IndexSet::new([3, 7, 9]).unwrap()).await;
        ledger.preset_indexes(&b, IndexSet::new([1, 2, 4]).unwrap()).await;

        let (registry, failures) =
            OracleRegistry::populate(&ledger, &[a.clone(), b.clone()], ETHER, Duration::from_secs(1))
                .await;
        assert!(failures.is_empty());

        assert_eq!(registry.eligible_for(7).collect::<Vec<_>>(), vec![&a]);
        assert_eq!(registry.eligible_for(2).collect::<Vec<_>>(), vec![&b]);
        assert_eq!(registry.eligible_for(5).count(), 0);
    }
}
