use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::{ProvisionerRegistry, ServiceError};
use crate::event::{Event, CANCELED_ERROR};
use crate::storage::models::{AutoScaleSpec, NodeAutoscaleRule};
use crate::storage::{Storage, StorageError};

const RUN_INTERVAL: Duration = Duration::from_secs(60 * 60);
const WAIT_NEW_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AutoscaleError {
    #[error("invalid rule, scale down ratio needs to be greater than 1.0, got {0}")]
    ScaleDownRatio(f64),

    #[error("invalid rule, max memory ratio may not be negative, got {0}")]
    MaxMemoryRatio(f64),
}

/// Reject node autoscale rules the scaler cannot honor.
pub fn validate_rule(rule: &NodeAutoscaleRule) -> Result<(), AutoscaleError> {
    if rule.scale_down_ratio <= 1.0 {
        return Err(AutoscaleError::ScaleDownRatio(rule.scale_down_ratio));
    }
    if rule.max_memory_ratio < 0.0 {
        return Err(AutoscaleError::MaxMemoryRatio(rule.max_memory_ratio));
    }
    Ok(())
}

/// CPU target in millicores. Accepts `600m`, `60%` or a plain core count.
pub fn parse_average_cpu(value: &str) -> Option<u64> {
    let value = value.trim();
    let milli = if let Some(m) = value.strip_suffix('m') {
        m.parse::<u64>().ok()?
    } else if let Some(p) = value.strip_suffix('%') {
        p.parse::<u64>().ok()? * 10
    } else {
        (value.parse::<f64>().ok()? * 1000.0).round() as u64
    };
    (milli > 0).then_some(milli)
}

/// Validation applied to an app unit autoscale spec before it reaches a provisioner.
pub fn validate_app_spec(spec: &AutoScaleSpec) -> Result<(), ServiceError> {
    if spec.max_units == 0 {
        return Err(ServiceError::Validation(
            "maximum units must be greater than 0".into(),
        ));
    }
    if spec.min_units == 0 {
        return Err(ServiceError::Validation(
            "minimum units must be greater than 0".into(),
        ));
    }
    if spec.min_units > spec.max_units {
        return Err(ServiceError::Validation(
            "minimum units must be less than or equal to maximum units".into(),
        ));
    }
    if parse_average_cpu(&spec.average_cpu).is_none() {
        return Err(ServiceError::Validation(format!(
            "invalid average CPU value: {:?}",
            spec.average_cpu
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AutoscaleConfig {
    pub enabled: bool,
    #[serde(rename = "RunInterval")]
    pub run_interval_secs: u64,
    #[serde(rename = "WaitTimeNewMachine")]
    pub wait_new_time_secs: u64,
}

pub struct NodeAutoscaleService {
    storage: Storage,
    provisioners: ProvisionerRegistry,
}

impl NodeAutoscaleService {
    pub fn new(storage: Storage, provisioners: ProvisionerRegistry) -> Self {
        Self {
            storage,
            provisioners,
        }
    }

    pub async fn config(&self) -> Result<AutoscaleConfig, ServiceError> {
        let rules = self.storage.autoscale_rules.list().await?;
        Ok(AutoscaleConfig {
            enabled: rules.iter().any(|r| r.enabled),
            run_interval_secs: RUN_INTERVAL.as_secs(),
            wait_new_time_secs: WAIT_NEW_TIME.as_secs(),
        })
    }

    pub async fn rules(&self) -> Result<Vec<NodeAutoscaleRule>, ServiceError> {
        Ok(self.storage.autoscale_rules.list().await?)
    }

    /// Insert or replace the rule for the rule's metadata filter.
    pub async fn upsert(&self, rule: NodeAutoscaleRule) -> Result<(), ServiceError> {
        validate_rule(&rule)?;
        self.storage.autoscale_rules.upsert(rule).await?;
        Ok(())
    }

    pub async fn remove(&self, metadata_filter: &str) -> Result<(), ServiceError> {
        match self.storage.autoscale_rules.remove(metadata_filter).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound { .. }) => {
                Err(ServiceError::NotFound("rule not found".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run one cycle on every provisioner, stopping between provisioners
    /// when the event was canceled.
    pub async fn run(&self, evt: &Event) -> Result<(), ServiceError> {
        let rules = self.storage.autoscale_rules.list().await?;
        for provisioner in self.provisioners.all() {
            if evt.is_canceled().await? {
                evt.ack_cancel().await?;
                warn!("autoscale run {} canceled", evt.id());
                evt.log(CANCELED_ERROR);
                return Err(ServiceError::Canceled);
            }
            evt.log(format!("running autoscale on provisioner {}", provisioner.name()));
            provisioner.run_node_autoscale(&rules, evt).await?;
        }
        info!("autoscale run {} finished", evt.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(ratio: f64, memory: f64) -> NodeAutoscaleRule {
        NodeAutoscaleRule {
            metadata_filter: "pool1".into(),
            enabled: true,
            max_container_count: 0,
            scale_down_ratio: ratio,
            prevent_rebalance: false,
            max_memory_ratio: memory,
        }
    }

    #[test]
    fn test_rule_validation_messages() {
        assert_eq!(
            validate_rule(&rule(0.9, 2.0)).unwrap_err().to_string(),
            "invalid rule, scale down ratio needs to be greater than 1.0, got 0.9"
        );
        assert!(validate_rule(&rule(1.0, 0.0)).is_err());
        assert!(validate_rule(&rule(1.5, -1.0)).is_err());
        assert!(validate_rule(&rule(1.33, 0.0)).is_ok());
    }

    #[test]
    fn test_average_cpu_formats() {
        assert_eq!(parse_average_cpu("600m"), Some(600));
        assert_eq!(parse_average_cpu("60%"), Some(600));
        assert_eq!(parse_average_cpu("1.5"), Some(1500));
        assert_eq!(parse_average_cpu("0m"), None);
        assert_eq!(parse_average_cpu("lots"), None);
    }

    #[test]
    fn test_app_spec_validation() {
        let mut spec = AutoScaleSpec {
            process: "p1".into(),
            min_units: 2,
            max_units: 10,
            average_cpu: "600m".into(),
        };
        assert!(validate_app_spec(&spec).is_ok());
        spec.min_units = 11;
        assert!(validate_app_spec(&spec).is_err());
        spec.min_units = 2;
        spec.max_units = 0;
        assert!(validate_app_spec(&spec).is_err());
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_rule() {
        let svc = NodeAutoscaleService::new(
            Storage::memory(),
            ProvisionerRegistry::new(std::sync::Arc::new(super::super::LocalProvisioner::new())),
        );
        assert!(matches!(
            svc.upsert(rule(0.9, 2.0)).await,
            Err(ServiceError::InvalidAutoscaleRule(_))
        ));
        svc.upsert(rule(2.0, 2.0)).await.unwrap();
        assert_eq!(svc.rules().await.unwrap().len(), 1);
        svc.remove("pool1").await.unwrap();
        assert!(matches!(
            svc.remove("pool1").await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
