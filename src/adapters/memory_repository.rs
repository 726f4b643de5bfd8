//! In-memory repository, matching queries against the JSON projection of
//! each stored item. Backs tests and paper-trading runs that need order
//! and trade persistence without a database.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::error::TradeLoopError;
use crate::ports::repository_port::{Query, QueryOp, Repository};

pub struct InMemoryRepository<T> {
    items: BTreeMap<u64, Value>,
    next_id: u64,
    _marker: PhantomData<T>,
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryRepository<T> {
    pub fn new() -> Self {
        InMemoryRepository {
            items: BTreeMap::new(),
            next_id: 1,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn matches(item: &Value, query: &Query) -> bool {
    query.terms.iter().all(|(field, op)| {
        let Some(actual) = item.get(field) else {
            return false;
        };
        match op {
            QueryOp::Eq(expected) => actual == expected,
            QueryOp::Gt(expected) => compare(actual, expected) == Some(Ordering::Greater),
            QueryOp::Gte(expected) => {
                matches!(compare(actual, expected), Some(Ordering::Greater | Ordering::Equal))
            }
            QueryOp::Lt(expected) => compare(actual, expected) == Some(Ordering::Less),
            QueryOp::Lte(expected) => {
                matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal))
            }
        }
    })
}

impl<T> Repository<T> for InMemoryRepository<T>
where
    T: Serialize + DeserializeOwned,
{
    fn create(&mut self, item: T) -> Result<u64, TradeLoopError> {
        let value = serde_json::to_value(&item).map_err(|e| TradeLoopError::Storage {
            reason: format!("cannot serialize item: {e}"),
        })?;
        let id = self.next_id;
        self.next_id += 1;
        self.items.insert(id, value);
        Ok(id)
    }

    fn get(&self, id: u64) -> Result<Option<T>, TradeLoopError> {
        self.items
            .get(&id)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| TradeLoopError::Storage {
                    reason: format!("cannot deserialize item {id}: {e}"),
                })
            })
            .transpose()
    }

    fn update(&mut self, id: u64, item: T) -> Result<(), TradeLoopError> {
        if !self.items.contains_key(&id) {
            return Err(TradeLoopError::Storage {
                reason: format!("no item with id {id}"),
            });
        }
        let value = serde_json::to_value(&item).map_err(|e| TradeLoopError::Storage {
            reason: format!("cannot serialize item: {e}"),
        })?;
        self.items.insert(id, value);
        Ok(())
    }

    fn find(&self, query: &Query) -> Result<Option<T>, TradeLoopError> {
        Ok(self.get_all(query)?.into_iter().next())
    }

    fn get_all(&self, query: &Query) -> Result<Vec<T>, TradeLoopError> {
        self.items
            .values()
            .filter(|value| matches(value, query))
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| TradeLoopError::Storage {
                    reason: format!("cannot deserialize item: {e}"),
                })
            })
            .collect()
    }
}
