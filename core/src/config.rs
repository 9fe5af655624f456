//! System defaults and per-tenant configuration.
//!
//! RULE: Every read goes through a normalizer. A malformed stored blob
//! falls back to defaults field by field rather than failing a request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{CoreError, CoreResult},
    outcome_mode::OutcomeMode,
    store::CoreStore,
    win_cap::WinCapPolicy,
};

const OUTCOME_MODE_KEY: &str = "outcome_mode";
const WIN_CAP_POLICY_KEY: &str = "voucher_win_cap_policy";

/// Deployment-wide defaults, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    pub outcome_mode: OutcomeMode,
    pub voucher_win_cap_policy: WinCapPolicy,
}

impl SystemConfig {
    /// Load from `data_dir/system_config.json`.
    /// In tests, use SystemConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/system_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let raw: Value = serde_json::from_str(&content)?;
        if !raw.is_object() {
            anyhow::bail!("{path} must contain a JSON object");
        }
        Ok(Self::from_json(&raw))
    }

    pub fn default_test() -> Self {
        Self {
            outcome_mode: OutcomeMode::VoucherControlled,
            voucher_win_cap_policy: WinCapPolicy::default(),
        }
    }

    fn from_json(raw: &Value) -> Self {
        Self {
            outcome_mode: OutcomeMode::from_json(raw.get(OUTCOME_MODE_KEY)),
            voucher_win_cap_policy: WinCapPolicy::normalize(
                raw.get(WIN_CAP_POLICY_KEY).unwrap_or(&Value::Null),
            ),
        }
    }

    fn to_json_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            OUTCOME_MODE_KEY.to_string(),
            Value::String(self.outcome_mode.as_str().to_string()),
        );
        map.insert(WIN_CAP_POLICY_KEY.to_string(), self.voucher_win_cap_policy.to_json());
        map
    }
}

/// Configuration in force for one tenant.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EffectiveConfig {
    pub outcome_mode: OutcomeMode,
    pub win_cap_policy: WinCapPolicy,
}

/// Merge the tenant's override object over the system defaults, then
/// normalize the result. Object values (the win-cap policy) merge one
/// field at a time; anything else replaces the system value.
pub fn merge_config(system: &SystemConfig, tenant_override: Option<&Value>) -> EffectiveConfig {
    let mut merged = system.to_json_map();
    if let Some(Value::Object(overrides)) = tenant_override {
        for (key, value) in overrides {
            if let (Some(Value::Object(base)), Value::Object(fields)) = (merged.get_mut(key), value) {
                for (field, v) in fields {
                    base.insert(field.clone(), v.clone());
                }
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    let merged = SystemConfig::from_json(&Value::Object(merged));
    EffectiveConfig {
        outcome_mode: merged.outcome_mode,
        win_cap_policy: merged.voucher_win_cap_policy,
    }
}

pub fn effective_config(
    store: &CoreStore,
    system: &SystemConfig,
    tenant_id: &str,
) -> CoreResult<EffectiveConfig> {
    let overrides = store.tenant_config_json(tenant_id)?;
    Ok(merge_config(system, overrides.as_ref()))
}

/// Replace the tenant's override object.
pub fn set_tenant_config(
    store: &CoreStore,
    tenant_id: &str,
    overrides: &Value,
    now_ms: i64,
) -> CoreResult<()> {
    if !overrides.is_object() {
        return Err(CoreError::validation("tenant_config", "must be a JSON object"));
    }
    store.upsert_tenant_config(tenant_id, overrides, now_ms)
}
