//! Dynamic weights
//!
//! A weight list is evaluated in order; the first entry whose filters pass the
//! event gives the weight. Entries without filters always pass. No match means
//! weight 0.

use crate::models::ChargingEvent;
use crate::traits::FilterEvaluator;
use crate::AppResult;
use serde::{Deserialize, Serialize};

/// One conditional weight
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicWeight {
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,

    #[serde(rename = "Weight")]
    pub weight: f64,
}

impl DynamicWeight {
    /// Unconditional weight
    pub fn fixed(weight: f64) -> Self {
        Self {
            filter_ids: Vec::new(),
            weight,
        }
    }
}

/// Resolves the weight applicable to `event`
///
/// Filter errors (e.g. an unknown filter ID) are returned verbatim.
pub async fn weight_from_dynamics(
    weights: &[DynamicWeight],
    filters: &dyn FilterEvaluator,
    tenant: &str,
    event: &ChargingEvent,
) -> AppResult<f64> {
    for dw in weights {
        if dw.filter_ids.is_empty() || filters.pass(tenant, &dw.filter_ids, event).await? {
            return Ok(dw.weight);
        }
    }
    Ok(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::InlineFilterS;

    #[tokio::test]
    async fn test_first_passing_weight_wins() {
        let fltr = InlineFilterS::new();
        let ev = ChargingEvent::new("apolo.net", "EV").with_field("Account", "1001");
        let weights = vec![
            DynamicWeight {
                filter_ids: vec!["*string:~*req.Account:1002".to_string()],
                weight: 30.0,
            },
            DynamicWeight {
                filter_ids: vec!["*string:~*req.Account:1001".to_string()],
                weight: 20.0,
            },
            DynamicWeight::fixed(10.0),
        ];
        let w = weight_from_dynamics(&weights, &fltr, "apolo.net", &ev)
            .await
            .unwrap();
        assert_eq!(w, 20.0);
    }

    #[tokio::test]
    async fn test_no_weights_is_zero() {
        let fltr = InlineFilterS::new();
        let ev = ChargingEvent::new("apolo.net", "EV");
        let w = weight_from_dynamics(&[], &fltr, "apolo.net", &ev)
            .await
            .unwrap();
        assert_eq!(w, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_filter_is_error() {
        let fltr = InlineFilterS::new();
        let ev = ChargingEvent::new("apolo.net", "EV");
        let weights = vec![DynamicWeight {
            filter_ids: vec!["invalid_filter_format".to_string()],
            weight: 20.0,
        }];
        let err = weight_from_dynamics(&weights, &fltr, "apolo.net", &ev)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "NOT_FOUND:invalid_filter_format");
    }
}
