use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use prost_types::value::Kind;
use prost_types::{ListValue, Value};

use crate::{Error, FromSpanner};

#[derive(Debug, PartialEq)]
pub(crate) struct Columns {
    names: Vec<String>,
    by_name: BTreeMap<String, usize>,
}

impl Columns {
    pub(crate) fn new(names: Vec<String>) -> Self {
        let by_name = names
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self { names, by_name }
    }

    fn len(&self) -> usize {
        self.names.len()
    }
}

/// A row of a query's result.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    columns: Arc<Columns>,
    values: Vec<Value>,
}

impl Row {
    pub fn columns(&self) -> &[String] {
        &self.columns.names
    }

    pub fn get_value(&self, column: usize) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn get_by_name(&self, column_name: &str) -> Option<&Value> {
        self.columns
            .by_name
            .get(column_name)
            .and_then(|idx| self.get_value(*idx))
    }

    /// Converts the value of the named column.
    pub fn get<'a, T: FromSpanner<'a>>(&'a self, column_name: &str) -> Result<T, Error> {
        self.get_by_name(column_name)
            .ok_or_else(|| Error::Codec(format!("no such column: {}", column_name)))
            .and_then(T::from_spanner_nullable)
    }

    /// Converts the value at `column`.
    pub fn get_unchecked<'a, T: FromSpanner<'a>>(&'a self, column: usize) -> Result<T, Error> {
        self.get_value(column)
            .ok_or_else(|| Error::Codec(format!("no column at index {}", column)))
            .and_then(T::from_spanner_nullable)
    }
}

/// Partially received values that do not form a complete row yet.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PendingValues {
    values: Vec<Value>,
    /// The last value continues in the next partial result.
    chunked: bool,
}

/// Turns the flat, possibly chunked, values of partial results into rows.
#[derive(Debug, Default)]
pub(crate) struct RowAssembler {
    columns: Option<Arc<Columns>>,
    pending: PendingValues,
}

impl RowAssembler {
    pub(crate) fn columns(&self) -> Option<&[String]> {
        self.columns.as_ref().map(|columns| columns.names.as_slice())
    }

    /// Only the first metadata of a query is kept, resumed streams may repeat it.
    pub(crate) fn set_columns(&mut self, names: Vec<String>) {
        if self.columns.is_none() {
            self.columns = Some(Arc::new(Columns::new(names)));
        }
    }

    pub(crate) fn pending(&self) -> &PendingValues {
        &self.pending
    }

    pub(crate) fn restore(&mut self, pending: PendingValues) {
        self.pending = pending;
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.values.is_empty()
    }

    /// Appends the values of one partial result and returns the rows they complete.
    pub(crate) fn push(
        &mut self,
        values: Vec<Value>,
        chunked_value: bool,
    ) -> Result<VecDeque<Row>, Error> {
        if values.is_empty() {
            return Ok(VecDeque::new());
        }
        let columns = self
            .columns
            .clone()
            .ok_or_else(|| Error::Codec("missing result set metadata".to_string()))?;
        if columns.len() == 0 {
            return Err(Error::Codec("received values without columns".to_string()));
        }

        let mut values = values.into_iter();
        if self.pending.chunked {
            if let (Some(head), Some(tail)) = (self.pending.values.pop(), values.next()) {
                self.pending.values.push(merge(head, tail)?);
            }
        }
        self.pending.values.extend(values);
        self.pending.chunked = chunked_value;

        let complete = self.pending.values.len() - usize::from(self.pending.chunked);
        let rows = complete / columns.len();
        let mut drained = self.pending.values.drain(..rows * columns.len());
        Ok((0..rows)
            .map(|_| Row {
                columns: columns.clone(),
                values: drained.by_ref().take(columns.len()).collect(),
            })
            .collect())
    }
}

// A chunked value continues in the first value of the next message: strings are concatenated,
// lists are concatenated with their boundary elements merged when those are themselves chunks.
fn merge(head: Value, tail: Value) -> Result<Value, Error> {
    let kind = match (head.kind, tail.kind) {
        (Some(Kind::StringValue(mut head)), Some(Kind::StringValue(tail))) => {
            head.push_str(&tail);
            Kind::StringValue(head)
        }
        (Some(Kind::ListValue(mut head)), Some(Kind::ListValue(tail))) => {
            let mut tail = tail.values.into_iter();
            match (head.values.pop(), tail.next()) {
                (Some(last), Some(first)) if is_mergeable(&last) && is_mergeable(&first) => {
                    head.values.push(merge(last, first)?);
                }
                (last, first) => {
                    head.values.extend(last);
                    head.values.extend(first);
                }
            }
            head.values.extend(tail);
            Kind::ListValue(ListValue {
                values: head.values,
            })
        }
        (head, tail) => {
            return Err(Error::Codec(format!(
                "cannot merge chunked values {:?} and {:?}",
                head, tail
            )))
        }
    };
    Ok(Value { kind: Some(kind) })
}

fn is_mergeable(value: &Value) -> bool {
    matches!(
        value.kind,
        Some(Kind::StringValue(_)) | Some(Kind::ListValue(_))
    )
}
