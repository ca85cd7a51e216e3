//! Consistency sweep for the dual subscription index.
//!
//! `add_subscription` writes forward then reverse; `remove_subscription`
//! deletes forward then reverse. So a forward-only half-pair is an add
//! that never completed and a reverse-only half-pair is a remove that never
//! completed. Deleting the orphan repairs both.
//!
//! The sweep reads one index and then probes the other, so it must not run
//! while a subscribe for the same pair is mid-flight; schedule it off-peak.

use super::registry::{decode, RoutingStore};
use super::{StoreResult, Table};
use tracing::{info, warn};
use wsrelay_core::Subscription;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Forward keys with no reverse twin, removed.
    pub forward_orphans: usize,
    /// Reverse keys with no forward twin, removed.
    pub reverse_orphans: usize,
    /// Undecodable subscription records, removed.
    pub corrupt: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.forward_orphans == 0 && self.reverse_orphans == 0 && self.corrupt == 0
    }
}

impl RoutingStore {
    /// Find and delete subscription half-pairs and corrupt records.
    pub async fn sweep(&self) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();

        let (orphans, corrupt) = self
            .sweep_index(Table::SubscriptionsBySubject, Table::SubscriptionsByConnection)
            .await?;
        report.forward_orphans = orphans;
        report.corrupt += corrupt;

        let (orphans, corrupt) = self
            .sweep_index(Table::SubscriptionsByConnection, Table::SubscriptionsBySubject)
            .await?;
        report.reverse_orphans = orphans;
        report.corrupt += corrupt;

        if report.is_clean() {
            info!("sweep found no inconsistencies");
        } else {
            warn!(
                forward_orphans = report.forward_orphans,
                reverse_orphans = report.reverse_orphans,
                corrupt = report.corrupt,
                "sweep repaired subscription index"
            );
        }
        Ok(report)
    }

    /// Delete every entry of `index` whose twin in `mirror` is missing.
    /// Returns `(orphans, corrupt)`.
    async fn sweep_index(&self, index: Table, mirror: Table) -> StoreResult<(usize, usize)> {
        let kv = self.kv();
        let mut orphans = 0;
        let mut corrupt = 0;

        for (key, data) in kv.scan_prefix(index, "").await? {
            let sub: Subscription = match decode(index, &key, &data) {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(error = %e, "removing corrupt subscription record");
                    kv.delete(index, &key).await?;
                    corrupt += 1;
                    continue;
                }
            };

            let twin = match mirror {
                Table::SubscriptionsBySubject => sub.forward_key(),
                _ => sub.reverse_key(),
            };
            match kv.get(mirror, &twin).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    warn!(
                        table = %index,
                        key = %key,
                        connection_id = %sub.client.connection_id,
                        subject = %sub.subject,
                        "removing subscription half-pair"
                    );
                    kv.delete(index, &key).await?;
                    orphans += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((orphans, corrupt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, MemoryKv};
    use std::sync::Arc;
    use wsrelay_core::Client;

    #[tokio::test]
    async fn clean_store_reports_nothing() {
        let store = RoutingStore::new(Arc::new(MemoryKv::new()));
        store
            .add_subscription(&Client::new("c1", "d", "s"), "orders")
            .await
            .unwrap();
        let report = store.sweep().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(store.find_subscribers("orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn half_pairs_are_removed() {
        let kv = Arc::new(MemoryKv::new());
        let store = RoutingStore::new(kv.clone());

        let a = Subscription::new(Client::new("c1", "d", "s"), "orders");
        let b = Subscription::new(Client::new("c2", "d", "s"), "orders");
        let value_a = serde_json::to_vec(&a).unwrap();
        let value_b = serde_json::to_vec(&b).unwrap();

        // Interrupted add: forward only.
        kv.put(Table::SubscriptionsBySubject, &a.forward_key(), value_a)
            .await
            .unwrap();
        // Interrupted remove: reverse only.
        kv.put(Table::SubscriptionsByConnection, &b.reverse_key(), value_b)
            .await
            .unwrap();
        kv.put(Table::SubscriptionsBySubject, "junk_c9", b"not json".to_vec())
            .await
            .unwrap();

        let report = store.sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                forward_orphans: 1,
                reverse_orphans: 1,
                corrupt: 1,
            }
        );
        assert!(kv.is_empty().await);
        assert!(store.sweep().await.unwrap().is_clean());
    }
}
