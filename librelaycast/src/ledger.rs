//! Delivery ledger: which messages a source post produced in each destination

use crate::db::Database;
use crate::error::Result;
use crate::types::Delivery;

#[derive(Clone)]
pub struct DeliveryLedger {
    db: Database,
}

impl DeliveryLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a send; supersedes an earlier record for the same destination
    pub async fn record(
        &self,
        source_post_id: &str,
        destination_id: &str,
        message_ids: &[i64],
    ) -> Result<()> {
        self.db
            .record_delivery(
                source_post_id,
                destination_id,
                message_ids,
                chrono::Utc::now().timestamp(),
            )
            .await
    }

    /// Deliveries in the order they were recorded
    pub async fn lookup(&self, source_post_id: &str) -> Result<Vec<Delivery>> {
        self.db.deliveries_for(source_post_id).await
    }

    pub async fn forget(&self, source_post_id: &str, destination_id: &str) -> Result<bool> {
        self.db.forget_delivery(source_post_id, destination_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_rerecord_supersedes_previous_ids() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("ledger.db").to_str().unwrap())
            .await
            .unwrap();
        let ledger = DeliveryLedger::new(db);

        ledger.record("7", "-100", &[11, 12]).await.unwrap();
        ledger.record("7", "-100", &[21, 22]).await.unwrap();

        let deliveries = ledger.lookup("7").await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_ids, vec![21, 22]);
        assert!(ledger.lookup("8").await.unwrap().is_empty());
    }
}
