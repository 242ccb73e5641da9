use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The structured market context report. Every field is required; a draft
/// that fails to deserialize into this shape fails validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketContext {
    /// Time period, e.g. "2025-Q2".
    pub period: String,
    /// Main headline summarizing the market context.
    pub headline: String,
    /// Key macroeconomic drivers.
    pub macro_drivers: Vec<String>,
    /// Key statistics by name.
    pub key_stats: BTreeMap<String, f64>,
    /// Detailed narrative explaining the market context.
    pub narrative: String,
    /// Data sources used.
    pub sources: Vec<String>,
}

impl MarketContext {
    /// Validate a draft value against the schema.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Validation(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::Validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft() -> Value {
        json!({
            "period": "2025-Q2",
            "headline": "Equities extend gains as inflation cools",
            "macro_drivers": ["disinflation", "resilient labor market"],
            "key_stats": {"sp500_tr": 12.3, "ust10y_yield": 4.25},
            "narrative": "Markets advanced through the quarter...",
            "sources": ["market_outlook.txt"]
        })
    }

    #[test]
    fn valid_draft_passes() {
        let context = MarketContext::from_value(draft()).unwrap();
        assert_eq!(context.period, "2025-Q2");
        assert_eq!(context.key_stats["sp500_tr"], 12.3);
        assert_eq!(context.macro_drivers.len(), 2);
    }

    #[test]
    fn missing_field_fails_validation() {
        let mut value = draft();
        value.as_object_mut().unwrap().remove("headline");
        let result = MarketContext::from_value(value);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn wrong_type_fails_validation() {
        let mut value = draft();
        value["key_stats"] = json!("not a map");
        assert!(MarketContext::from_value(value).is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let context = MarketContext::from_value(draft()).unwrap();
        let restored = MarketContext::from_value(context.to_value().unwrap()).unwrap();
        assert_eq!(context, restored);
    }
}
