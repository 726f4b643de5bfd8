//! Repository port trait: the only storage interface the core assumes.
//!
//! Queries are field-name/value pairs; a `_gt`/`_gte`/`_lt`/`_lte` suffix
//! on the field name turns the exact match into a comparison.

use serde_json::Value;

use crate::domain::error::TradeLoopError;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOp {
    Eq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub terms: Vec<(String, QueryOp)>,
}

impl Query {
    pub fn new() -> Self {
        Query { terms: Vec::new() }
    }

    /// Parses suffixed field names: `("amount_gt", 5)` compares the
    /// `amount` field, `("symbol", "BTC")` matches exactly.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut terms = Vec::new();
        for (key, value) in pairs {
            let key = key.as_ref();
            let (field, op) = if let Some(field) = key.strip_suffix("_gte") {
                (field, QueryOp::Gte(value))
            } else if let Some(field) = key.strip_suffix("_lte") {
                (field, QueryOp::Lte(value))
            } else if let Some(field) = key.strip_suffix("_gt") {
                (field, QueryOp::Gt(value))
            } else if let Some(field) = key.strip_suffix("_lt") {
                (field, QueryOp::Lt(value))
            } else {
                (key, QueryOp::Eq(value))
            };
            terms.push((field.to_string(), op));
        }
        Query { terms }
    }
}

pub trait Repository<T> {
    fn create(&mut self, item: T) -> Result<u64, TradeLoopError>;
    fn get(&self, id: u64) -> Result<Option<T>, TradeLoopError>;
    fn update(&mut self, id: u64, item: T) -> Result<(), TradeLoopError>;
    fn find(&self, query: &Query) -> Result<Option<T>, TradeLoopError>;
    fn get_all(&self, query: &Query) -> Result<Vec<T>, TradeLoopError>;
}
