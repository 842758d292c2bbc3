//! Table schemas and the foreign-key dependency graph.
//!
//! The graph is built once, validated before any sync activity, and shared
//! read-only by every zone.

use crate::error::{SyncError, SyncResult};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use zonesync_protocol::{FieldMap, FieldValue, KeyValue, RecordKey};

/// What happens to a referencing row when its target is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteAction {
    /// Delete the referencing row too.
    Cascade,
    /// Null out the referencing column.
    SetNull,
    /// Refuse the deletion while references remain.
    NoAction,
}

/// A foreign-key edge from one table to another (or itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub target_table: String,
    /// Referenced column. Must be the target's primary key.
    pub target_column: String,
    /// Action on delete of the target.
    pub on_delete: DeleteAction,
    /// Whether the constraint is checked at commit instead of per statement.
    pub deferred: bool,
}

impl ForeignKey {
    /// Creates a non-deferred foreign key.
    pub fn new(
        column: impl Into<String>,
        target_table: impl Into<String>,
        target_column: impl Into<String>,
        on_delete: DeleteAction,
    ) -> Self {
        Self {
            column: column.into(),
            target_table: target_table.into(),
            target_column: target_column.into(),
            on_delete,
            deferred: false,
        }
    }

    /// Marks the constraint as deferred.
    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }
}

/// Declaration of one synchronized table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Primary-key column.
    pub primary_key: String,
    /// Non-reference columns every incoming record must carry.
    pub required: Vec<String>,
    /// Foreign keys in declaration order.
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Creates a table with only a primary key.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            required: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Declares a required column.
    #[must_use]
    pub fn required(mut self, column: impl Into<String>) -> Self {
        self.required.push(column.into());
        self
    }

    /// Declares a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Returns true if `column` is declared on this table.
    pub fn has_column(&self, column: &str) -> bool {
        column == self.primary_key
            || self.required.iter().any(|c| c == column)
            || self.foreign_keys.iter().any(|fk| fk.column == column)
    }
}

/// A table referencing another through one foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    /// Referencing table.
    pub table: String,
    /// Referencing column.
    pub column: String,
    /// Action on delete of the referenced row.
    pub on_delete: DeleteAction,
}

/// A validated table plus derived graph facts.
#[derive(Debug, Clone)]
pub struct TableNode {
    /// The declaration.
    pub schema: TableSchema,
    /// True if some foreign key targets the table itself.
    pub self_referential: bool,
}

/// Read-only dependency graph over all synchronized tables.
#[derive(Debug, Clone)]
pub struct SchemaGraph {
    tables: BTreeMap<String, TableNode>,
    dependents: HashMap<String, Vec<Dependent>>,
    declared: Vec<String>,
}

impl SchemaGraph {
    /// Builds and validates the graph.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] when:
    /// - two tables share a name
    /// - a foreign key names an undeclared column, table or non-primary-key
    ///   target column, or reuses the primary key column
    /// - a self-referential or cyclic foreign key is non-deferred `NoAction`
    pub fn new(schemas: Vec<TableSchema>) -> SyncResult<Self> {
        let mut tables = BTreeMap::new();
        let mut declared = Vec::with_capacity(schemas.len());

        for schema in schemas {
            if tables.contains_key(&schema.name) {
                return Err(SyncError::configuration(format!(
                    "table {} declared twice",
                    schema.name
                )));
            }
            let self_referential = schema
                .foreign_keys
                .iter()
                .any(|fk| fk.target_table == schema.name);
            declared.push(schema.name.clone());
            tables.insert(
                schema.name.clone(),
                TableNode {
                    schema,
                    self_referential,
                },
            );
        }

        let mut dependents: HashMap<String, Vec<Dependent>> = HashMap::new();
        for name in &declared {
            let schema = &tables[name].schema;
            let mut seen_columns = HashSet::new();
            for fk in &schema.foreign_keys {
                if fk.column == schema.primary_key {
                    return Err(SyncError::configuration(format!(
                        "{}.{} is both primary key and foreign key",
                        schema.name, fk.column
                    )));
                }
                if !seen_columns.insert(fk.column.as_str()) {
                    return Err(SyncError::configuration(format!(
                        "{}.{} declares more than one foreign key",
                        schema.name, fk.column
                    )));
                }
                let target = tables.get(&fk.target_table).ok_or_else(|| {
                    SyncError::configuration(format!(
                        "{}.{} references undeclared table {}",
                        schema.name, fk.column, fk.target_table
                    ))
                })?;
                if fk.target_column != target.schema.primary_key {
                    return Err(SyncError::configuration(format!(
                        "{}.{} references {}.{}, which is not its primary key",
                        schema.name, fk.column, fk.target_table, fk.target_column
                    )));
                }
                dependents
                    .entry(fk.target_table.clone())
                    .or_default()
                    .push(Dependent {
                        table: schema.name.clone(),
                        column: fk.column.clone(),
                        on_delete: fk.on_delete,
                    });
            }
        }

        let graph = Self {
            tables,
            dependents,
            declared,
        };
        graph.validate_cycles()?;
        Ok(graph)
    }

    fn validate_cycles(&self) -> SyncResult<()> {
        for name in &self.declared {
            for fk in &self.tables[name].schema.foreign_keys {
                let cyclic = fk.target_table == *name || self.reaches(&fk.target_table, name);
                if cyclic && fk.on_delete == DeleteAction::NoAction && !fk.deferred {
                    return Err(SyncError::configuration(format!(
                        "{name}.{} is part of a reference cycle and must cascade, set null or be deferred",
                        fk.column
                    )));
                }
            }
        }
        Ok(())
    }

    /// True if `from` reaches `to` by following foreign keys.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(table) = queue.pop_front() {
            if table == to {
                return true;
            }
            if !seen.insert(table) {
                continue;
            }
            if let Some(node) = self.tables.get(table) {
                queue.extend(node.schema.foreign_keys.iter().map(|fk| fk.target_table.as_str()));
            }
        }
        false
    }

    /// Returns the table declaration.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name).map(|n| &n.schema)
    }

    /// Returns the table declaration or a malformed-record error.
    pub fn require_table(&self, name: &str) -> SyncResult<&TableSchema> {
        self.table(name)
            .ok_or_else(|| SyncError::malformed(name, "unknown table"))
    }

    /// Returns true if the table references itself.
    pub fn is_self_referential(&self, name: &str) -> bool {
        self.tables.get(name).is_some_and(|n| n.self_referential)
    }

    /// Tables referencing `table`, with the referencing column and action.
    pub fn dependents_of(&self, table: &str) -> &[Dependent] {
        self.dependents.get(table).map_or(&[], Vec::as_slice)
    }

    /// Table names in declaration order.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.declared.iter().map(String::as_str)
    }

    /// Keys of the rows `fields` references, in foreign-key declaration order.
    ///
    /// Null and absent reference columns are skipped.
    ///
    /// # Errors
    ///
    /// Fails for an unknown table, or a reference value that cannot be a key.
    pub fn parent_keys(&self, table: &str, fields: &FieldMap) -> SyncResult<Vec<RecordKey>> {
        let schema = self.require_table(table)?;
        let mut parents = Vec::new();
        for fk in &schema.foreign_keys {
            let Some(field) = fields.get(&fk.column) else {
                continue;
            };
            if field.value == FieldValue::Null {
                continue;
            }
            let id = KeyValue::from_field(&field.value).map_err(|e| {
                SyncError::malformed(format!("{table}.{}", fk.column), e.to_string())
            })?;
            parents.push(RecordKey {
                table: fk.target_table.clone(),
                id,
            });
        }
        Ok(parents)
    }
}
