use crate::errors::ControllerError;
use async_trait::async_trait;
use std::{collections::BTreeMap, time::SystemTime};
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AlertStatus {
    /// Recorded but not yet delivered.
    Pending,
    Alerted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AlertRecord {
    pub host_name: String,
    pub description: String,
    pub status: AlertStatus,
    pub created_at: SystemTime,
}

/// Persistence of alerts about worker nodes.
#[async_trait]
pub(crate) trait AlertStore: Send + Sync {
    /// Record an alert for `host_name`, returns `false` if an alert for that host
    /// is still pending.
    async fn record(&self, host_name: &str, description: &str) -> Result<bool, ControllerError>;

    /// All alerts not yet delivered, ordered by host name.
    async fn pending(&self) -> Result<Vec<AlertRecord>, ControllerError>;

    /// Mark the pending alert of `host_name` as delivered.
    async fn mark_alerted(&self, host_name: &str) -> Result<(), ControllerError>;
}

#[derive(Default)]
pub(crate) struct InMemoryAlertStore {
    records: Mutex<Vec<AlertRecord>>,
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn record(&self, host_name: &str, description: &str) -> Result<bool, ControllerError> {
        let mut records = self.records.lock().await;
        if records
            .iter()
            .any(|r| r.host_name == host_name && r.status == AlertStatus::Pending)
        {
            return Ok(false);
        }
        records.push(AlertRecord {
            host_name: host_name.to_string(),
            description: description.to_string(),
            status: AlertStatus::Pending,
            created_at: SystemTime::now(),
        });
        Ok(true)
    }

    async fn pending(&self) -> Result<Vec<AlertRecord>, ControllerError> {
        let records = self.records.lock().await;
        let pending: BTreeMap<&str, &AlertRecord> = records
            .iter()
            .filter(|r| r.status == AlertStatus::Pending)
            .map(|r| (r.host_name.as_str(), r))
            .collect();
        Ok(pending.into_values().cloned().collect())
    }

    async fn mark_alerted(&self, host_name: &str) -> Result<(), ControllerError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.host_name == host_name && r.status == AlertStatus::Pending)
            .ok_or_else(|| {
                ControllerError::NotFound(format!("pending alert for {}", host_name))
            })?;
        record.status = AlertStatus::Alerted;
        Ok(())
    }
}

/// Hands the pending alerts over to the log and marks them alerted.
pub(crate) async fn deliver_pending(store: &dyn AlertStore) -> Result<usize, ControllerError> {
    let pending = store.pending().await?;
    if pending.is_empty() {
        debug!("no alerts to deliver");
    }
    for record in &pending {
        warn!(
            "ALERT {}: {} (recorded {}s ago)",
            record.host_name,
            record.description,
            record.created_at.elapsed().unwrap_or_default().as_secs()
        );
        store.mark_alerted(&record.host_name).await?;
    }
    Ok(pending.len())
}
