//! Canonical entity table
//!
//! Exactly one [`Record`] per id. Mutation during a `store()` call goes through
//! a [`Staging`] overlay so that a failed call leaves the table untouched.

use crate::graph::{EntityId, Fields, Record};
use crate::graph::value::{ID_FIELD, TYPENAME_FIELD};
use std::collections::HashMap;

/// Id-indexed table of canonical records
#[derive(Debug, Clone, Default)]
pub struct EntityTable {
    records: HashMap<EntityId, Record>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Insert or replace a record
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<Record> {
        self.records.remove(id)
    }

    /// All records of one typename, sorted by id
    pub fn by_type(&self, typename: &str) -> Vec<&Record> {
        let mut records: Vec<_> = self
            .records
            .values()
            .filter(|r| r.typename == typename)
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// All records matching every key/value of `predicate`, sorted by id
    ///
    /// `id` and `typename` keys match the record's identity; other keys match
    /// fields using change-detection equality.
    pub fn filter(&self, predicate: &Fields) -> Vec<&Record> {
        let mut records: Vec<_> = self
            .records
            .values()
            .filter(|record| matches_predicate(record, predicate))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Apply the changes collected by a [`Staging`] overlay
    pub(crate) fn apply(&mut self, changes: HashMap<EntityId, Option<Record>>) {
        for (id, change) in changes {
            match change {
                Some(record) => {
                    self.records.insert(id, record);
                }
                None => {
                    self.records.remove(&id);
                }
            }
        }
    }
}

fn matches_predicate(record: &Record, predicate: &Fields) -> bool {
    predicate.iter().all(|(key, expected)| match key.as_str() {
        ID_FIELD => expected.as_str() == Some(record.id.as_str()),
        TYPENAME_FIELD => expected.as_str() == Some(record.typename.as_str()),
        _ => record
            .fields
            .get(key)
            .is_some_and(|actual| actual.diff_eq(expected)),
    })
}

/// Copy-on-write overlay over an [`EntityTable`]
///
/// `None` in `changes` marks a deletion.
pub(crate) struct Staging<'a> {
    base: &'a EntityTable,
    changes: HashMap<EntityId, Option<Record>>,
}

impl<'a> Staging<'a> {
    pub fn new(base: &'a EntityTable) -> Self {
        Self {
            base,
            changes: HashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        match self.changes.get(id) {
            Some(change) => change.as_ref(),
            None => self.base.get(id),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Mutable access, copying the base record into the overlay on first write
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        if !self.changes.contains_key(id) {
            let record = self.base.get(id)?.clone();
            self.changes.insert(record.id.clone(), Some(record));
        }
        self.changes.get_mut(id).and_then(Option::as_mut)
    }

    pub fn put(&mut self, record: Record) {
        self.changes.insert(record.id.clone(), Some(record));
    }

    /// Remove a record, returning it if it existed
    pub fn remove(&mut self, id: &EntityId) -> Option<Record> {
        let previous = self.get(id.as_str()).cloned();
        if previous.is_some() {
            self.changes.insert(id.clone(), None);
        }
        previous
    }

    pub fn into_changes(self) -> HashMap<EntityId, Option<Record>> {
        self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Value;

    fn table() -> EntityTable {
        let mut table = EntityTable::new();
        table.insert(Record::new("p2", "Person").with_field("name", "Bob"));
        table.insert(Record::new("p1", "Person").with_field("name", "Ada"));
        table.insert(Record::new("a1", "Article").with_field("title", "Foo"));
        table
    }

    #[test]
    fn test_by_type_sorted() {
        let table = table();
        let people = table.by_type("Person");
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].id.as_str(), "p1");
    }

    #[test]
    fn test_filter_by_fields_and_identity() {
        let table = table();
        let mut predicate = Fields::new();
        predicate.insert("name".to_string(), Value::from("Bob"));
        let found = table.filter(&predicate);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "p2");

        let mut predicate = Fields::new();
        predicate.insert("typename".to_string(), Value::from("Article"));
        assert_eq!(table.filter(&predicate).len(), 1);
    }

    #[test]
    fn test_staging_is_isolated_until_applied() {
        let mut table = table();
        let changes = {
            let mut staging = Staging::new(&table);
            staging
                .get_mut("p1")
                .unwrap()
                .fields
                .insert("name".to_string(), Value::from("Ada L."));
            staging.remove(&EntityId::new("a1"));
            staging.put(Record::new("p3", "Person"));

            assert!(!staging.contains("a1"));
            assert!(staging.contains("p3"));
            assert_eq!(table.get("p1").unwrap().get("name"), Some(&Value::from("Ada")));
            staging.into_changes()
        };

        table.apply(changes);
        assert_eq!(table.get("p1").unwrap().get("name"), Some(&Value::from("Ada L.")));
        assert!(!table.contains("a1"));
        assert!(table.contains("p3"));
    }

    #[test]
    fn test_staging_remove_missing_is_noop() {
        let table = table();
        let mut staging = Staging::new(&table);
        assert!(staging.remove(&EntityId::new("nope")).is_none());
        assert!(staging.into_changes().is_empty());
    }
}
