//! Profile Document Store (§4.L) — per `(module, profile, collection)` JSON
//! records with the filter DSL.
//!
//! Directly re-expresses `original_source/.../profile_store.py`'s
//! `ProfileStoreFilter`/`_build_query`: nested field access splits on `.`
//! and walks `Value::Object` indexing; evaluated in Rust over decoded
//! `serde_json::Value` rows since `redb` has no query language of its own.

use crate::error::{CoreError, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const DOC_STORE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("profile_documents");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    pub module_id: String,
    pub profile: String,
    pub collection: String,
    pub value: serde_json::Value,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

/// Wraps `sort_by: { field.path: asc|desc }` — an ordered list even though
/// it arrives as a JSON object, since "chained lexicographic sort" needs
/// the caller's field order. Relies on `serde_json`'s `preserve_order`
/// feature keeping object key order intact through deserialization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SortSpec(pub Vec<(String, SortDir)>);

impl<'de> Deserialize<'de> for SortSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = serde_json::Map::deserialize(deserializer)?;
        let mut out = Vec::with_capacity(map.len());
        for (field, dir) in map {
            let dir = match dir.as_str() {
                Some("asc") => SortDir::Asc,
                Some("desc") => SortDir::Desc,
                _ => {
                    return Err(serde::de::Error::custom(
                        "sort_by values must be \"asc\" or \"desc\"",
                    ))
                }
            };
            out.push((field, dir));
        }
        Ok(SortSpec(out))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CombineOp {
    And,
    Or,
}

/// The recursive filter language (§4.L). A leaf filter carries
/// `value_filters`; a composite filter carries `sub_filters`/`combine_op`
/// instead — the two shapes are mutually exclusive by construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub value_filters: HashMap<String, HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub sort_by: Option<SortSpec>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub sub_filters: Vec<Filter>,
    pub combine_op: Option<CombineOp>,
}

impl Filter {
    pub fn and(filters: Vec<Filter>) -> Filter {
        Filter {
            sub_filters: filters,
            combine_op: Some(CombineOp::And),
            ..Default::default()
        }
    }

    pub fn or(filters: Vec<Filter>) -> Filter {
        Filter {
            sub_filters: filters,
            combine_op: Some(CombineOp::Or),
            ..Default::default()
        }
    }

    fn matches(&self, value: &serde_json::Value) -> bool {
        if !self.sub_filters.is_empty() {
            return match self.combine_op.unwrap_or(CombineOp::And) {
                CombineOp::And => self.sub_filters.iter().all(|f| f.matches(value)),
                CombineOp::Or => self.sub_filters.iter().any(|f| f.matches(value)),
            };
        }
        self.value_filters
            .iter()
            .all(|(path, ops)| ops.iter().all(|(op, rhs)| eval_op(value, path, op, rhs)))
    }
}

fn get_nested<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn numeric_cmp(field: &serde_json::Value, rhs: &serde_json::Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (field.as_f64(), rhs.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (field.as_str(), rhs.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

fn eval_op(value: &serde_json::Value, path: &str, op: &str, rhs: &serde_json::Value) -> bool {
    let Some(field) = get_nested(value, path) else {
        return false;
    };
    match op {
        "eq" => field == rhs,
        "lt" => numeric_cmp(field, rhs).is_some_and(|o| o.is_lt()),
        "lte" => numeric_cmp(field, rhs).is_some_and(|o| o.is_le()),
        "gt" => numeric_cmp(field, rhs).is_some_and(|o| o.is_gt()),
        "gte" => numeric_cmp(field, rhs).is_some_and(|o| o.is_ge()),
        "in" => rhs.as_array().is_some_and(|arr| arr.iter().any(|v| v == field)),
        "contains" => match field {
            serde_json::Value::Array(items) => items.iter().any(|v| v == rhs),
            serde_json::Value::Object(obj) => match rhs.as_object() {
                Some(sub) => sub.iter().all(|(k, v)| obj.get(k) == Some(v)),
                None => false,
            },
            _ => false,
        },
        _ => false,
    }
}

fn record_key(module_id: &str, profile: &str, collection: &str, id: &str) -> String {
    format!("{module_id}|{profile}|{collection}|{id}")
}

pub struct ProfileDocumentStore {
    db: Arc<Database>,
}

impl ProfileDocumentStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DOC_STORE_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn set_value(
        &self,
        module_id: &str,
        profile: &str,
        collection: &str,
        value: serde_json::Value,
    ) -> Result<ProfileRecord> {
        let now = crate::util::now_ts_secs();
        let record = ProfileRecord {
            id: uuid::Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
            profile: profile.to_string(),
            collection: collection.to_string(),
            value,
            created_at: now,
            updated_at: now,
        };
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOC_STORE_TABLE)?;
            let key = record_key(module_id, profile, collection, &record.id);
            table.insert(key.as_str(), serde_json::to_string(&record)?.as_str())?;
        }
        write_txn.commit()?;
        Ok(record)
    }

    pub fn set_many(
        &self,
        module_id: &str,
        profile: &str,
        collection: &str,
        values: Vec<serde_json::Value>,
    ) -> Result<Vec<ProfileRecord>> {
        values
            .into_iter()
            .map(|v| self.set_value(module_id, profile, collection, v))
            .collect()
    }

    fn scan(&self, module_id: &str, profile: &str, collection: &str) -> Result<Vec<ProfileRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DOC_STORE_TABLE)?;
        let prefix = format!("{module_id}|{profile}|{collection}|");
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            if key.value().starts_with(&prefix) {
                out.push(serde_json::from_str(value.value())?);
            }
        }
        Ok(out)
    }

    pub fn find(
        &self,
        module_id: &str,
        profile: &str,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<ProfileRecord>> {
        let mut rows: Vec<ProfileRecord> = self
            .scan(module_id, profile, collection)?
            .into_iter()
            .filter(|r| filter.matches(&r.value))
            .collect();

        if let Some(sort) = &filter.sort_by {
            rows.sort_by(|a, b| {
                for (path, dir) in &sort.0 {
                    let av = get_nested(&a.value, path);
                    let bv = get_nested(&b.value, path);
                    let ordering = match (av, bv) {
                        (Some(av), Some(bv)) => numeric_cmp(av, bv).unwrap_or(std::cmp::Ordering::Equal),
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (None, None) => std::cmp::Ordering::Equal,
                    };
                    let ordering = match dir {
                        SortDir::Asc => ordering,
                        SortDir::Desc => ordering.reverse(),
                    };
                    if ordering != std::cmp::Ordering::Equal {
                        return ordering;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let offset = filter.offset.unwrap_or(0);
        rows = rows.into_iter().skip(offset).collect();
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    pub fn update(
        &self,
        module_id: &str,
        profile: &str,
        collection: &str,
        filter: &Filter,
        new_value: serde_json::Value,
    ) -> Result<usize> {
        let matching = self.find(module_id, profile, collection, filter)?;
        let now = crate::util::now_ts_secs();
        let write_txn = self.db.begin_write()?;
        let mut count = 0;
        {
            let mut table = write_txn.open_table(DOC_STORE_TABLE)?;
            for record in matching {
                let key = record_key(module_id, profile, collection, &record.id);
                let updated = ProfileRecord {
                    value: new_value.clone(),
                    updated_at: now,
                    ..record
                };
                table.insert(key.as_str(), serde_json::to_string(&updated)?.as_str())?;
                count += 1;
            }
        }
        write_txn.commit()?;
        Ok(count)
    }

    pub fn delete(
        &self,
        module_id: &str,
        profile: &str,
        collection: &str,
        filter: &Filter,
    ) -> Result<usize> {
        let matching = self.find(module_id, profile, collection, filter)?;
        let write_txn = self.db.begin_write()?;
        let mut count = 0;
        {
            let mut table = write_txn.open_table(DOC_STORE_TABLE)?;
            for record in matching {
                let key = record_key(module_id, profile, collection, &record.id);
                table.remove(key.as_str())?;
                count += 1;
            }
        }
        write_txn.commit()?;
        Ok(count)
    }

    /// Fetches a single row by uuid regardless of which
    /// `(module, profile, collection)` it lives under — there is no
    /// secondary index, so this is an O(n) table scan.
    pub fn get_by_id(&self, id: &str) -> Result<Option<ProfileRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DOC_STORE_TABLE)?;
        for row in table.iter()? {
            let (key, value) = row?;
            if key.value().ends_with(&format!("|{id}")) {
                return Ok(Some(serde_json::from_str(value.value())?));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> ProfileDocumentStore {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(redb::Database::create(dir.path().join("test.redb")).unwrap());
        std::mem::forget(dir);
        ProfileDocumentStore::new(db).unwrap()
    }

    #[test]
    fn set_value_round_trips_through_get_by_id() {
        let store = test_store();
        let value = serde_json::json!({"price": 42, "tags": ["sale"]});
        let record = store.set_value("m1", "p1", "items", value.clone()).unwrap();
        let fetched = store.get_by_id(&record.id).unwrap().unwrap();
        assert_eq!(fetched.value, value);
    }

    #[test]
    fn delete_then_find_returns_empty() {
        let store = test_store();
        store.set_value("m1", "p1", "items", serde_json::json!({"n": 1})).unwrap();
        let filter = Filter {
            value_filters: HashMap::from([("n".to_string(), HashMap::from([("eq".to_string(), serde_json::json!(1))]))]),
            ..Default::default()
        };
        assert_eq!(store.delete("m1", "p1", "items", &filter).unwrap(), 1);
        assert!(store.find("m1", "p1", "items", &filter).unwrap().is_empty());
    }

    #[test]
    fn range_filter_with_sort_and_limit() {
        let store = test_store();
        for n in 0..100 {
            let tag = if n % 2 == 0 { "sale" } else { "full" };
            store
                .set_value("m1", "p1", "items", serde_json::json!({"price": n, "tags": [tag]}))
                .unwrap();
        }
        let mut value_filters = HashMap::new();
        value_filters.insert(
            "price".to_string(),
            HashMap::from([
                ("gte".to_string(), serde_json::json!(10)),
                ("lt".to_string(), serde_json::json!(20)),
            ]),
        );
        let filter = Filter {
            value_filters,
            sort_by: Some(SortSpec(vec![("price".to_string(), SortDir::Asc)])),
            limit: Some(5),
            ..Default::default()
        };
        let rows = store.find("m1", "p1", "items", &filter).unwrap();
        assert_eq!(rows.len(), 5);
        let prices: Vec<i64> = rows.iter().map(|r| r.value["price"].as_i64().unwrap()).collect();
        assert!(prices.iter().all(|p| (10..20).contains(p)));
        assert!(prices.windows(2).all(|w| w[0] <= w[1]));
    }
}
