//! Inline filter evaluator
//!
//! Basic [`FilterEvaluator`] understanding inline rules of the form
//! `*type:~*req.Field:value1|value2` plus named filters registered up front.
//! Full filter profiles live in an external service; this evaluator covers
//! what the engines and their tests need.

use crate::error::AppError;
use crate::models::event::value_as_string;
use crate::models::ChargingEvent;
use crate::traits::FilterEvaluator;
use crate::AppResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleType {
    String,
    NotString,
    Prefix,
    Exists,
    NotExists,
}

#[derive(Debug, Clone)]
struct InlineRule {
    rule_type: RuleType,
    path: String,
    values: Vec<String>,
}

impl InlineRule {
    fn parse(raw: &str) -> AppResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let (Some(kind), Some(path)) = (parts.next(), parts.next()) else {
            return Err(AppError::Config(format!("malformed inline filter: {}", raw)));
        };
        let values = parts
            .next()
            .filter(|v| !v.is_empty())
            .map(|v| v.split('|').map(str::to_string).collect())
            .unwrap_or_default();
        let rule_type = match kind {
            "*string" => RuleType::String,
            "*notstring" => RuleType::NotString,
            "*prefix" => RuleType::Prefix,
            "*exists" => RuleType::Exists,
            "*notexists" => RuleType::NotExists,
            other => {
                return Err(AppError::Config(format!(
                    "unsupported filter type: {}",
                    other
                )))
            }
        };
        Ok(Self {
            rule_type,
            path: path.to_string(),
            values,
        })
    }

    fn lookup(&self, event: &ChargingEvent) -> AppResult<Option<String>> {
        let path = self.path.trim_start_matches('~');
        let value = if let Some(field) = path.strip_prefix("*req.") {
            event.field(field)
        } else if let Some(opt) = path.strip_prefix("*opts.") {
            event.opt(opt)
        } else {
            return Err(AppError::Config(format!(
                "unsupported filter path: {}",
                self.path
            )));
        };
        Ok(value.and_then(value_as_string))
    }

    fn pass(&self, event: &ChargingEvent) -> AppResult<bool> {
        let value = self.lookup(event)?;
        Ok(match self.rule_type {
            RuleType::Exists => value.is_some(),
            RuleType::NotExists => value.is_none(),
            RuleType::String => value.is_some_and(|v| self.values.iter().any(|x| *x == v)),
            RuleType::NotString => !value.is_some_and(|v| self.values.iter().any(|x| *x == v)),
            RuleType::Prefix => {
                value.is_some_and(|v| self.values.iter().any(|x| v.starts_with(x.as_str())))
            }
        })
    }
}

/// In-process evaluator for inline rules and registered named filters
#[derive(Debug, Default)]
pub struct InlineFilterS {
    named: RwLock<HashMap<String, Vec<String>>>,
}

impl InlineFilterS {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named filter made of inline rules, all of which must pass
    pub fn register(&self, tenant: &str, id: &str, rules: Vec<String>) {
        self.named.write().insert(format!("{}:{}", tenant, id), rules);
    }

    fn rules_for(&self, tenant: &str, filter_id: &str) -> AppResult<Vec<String>> {
        if filter_id.starts_with('*') {
            return Ok(vec![filter_id.to_string()]);
        }
        self.named
            .read()
            .get(&format!("{}:{}", tenant, filter_id))
            .cloned()
            .ok_or_else(|| AppError::NotFound(filter_id.to_string()))
    }
}

#[async_trait]
impl FilterEvaluator for InlineFilterS {
    async fn pass(
        &self,
        tenant: &str,
        filter_ids: &[String],
        event: &ChargingEvent,
    ) -> AppResult<bool> {
        for filter_id in filter_ids {
            for raw in self.rules_for(tenant, filter_id)? {
                if !InlineRule::parse(&raw)?.pass(event)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
