use super::{ColumnId, Value};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored row: cells keyed by column id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    cells: BTreeMap<ColumnId, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ColumnId) -> Option<&Value> {
        self.cells.get(&id)
    }

    pub fn set(&mut self, id: ColumnId, value: Value) {
        self.cells.insert(id, value);
    }

    pub fn cells(&self) -> impl Iterator<Item = (&ColumnId, &Value)> {
        self.cells.iter()
    }

    pub fn estimated_size(&self) -> usize {
        self.cells.values().map(|v| v.estimated_size() + 4).sum()
    }
}

impl FromIterator<(ColumnId, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (ColumnId, Value)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

/// A post-insert mutation of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowChange {
    Update(Vec<(ColumnId, Value)>),
    Delete,
    /// Restores a deleted row. Only ever generated inside the server.
    Reinsert(Row),
}

impl RowChange {
    pub fn kind(&self) -> &'static str {
        match self {
            RowChange::Update(_) => "UPDATE",
            RowChange::Delete => "DELETE",
            RowChange::Reinsert(_) => "REINSERT",
        }
    }

    pub fn estimated_size(&self) -> usize {
        match self {
            RowChange::Update(cells) => cells.iter().map(|(_, v)| v.estimated_size() + 4).sum(),
            RowChange::Delete => 1,
            RowChange::Reinsert(row) => row.estimated_size(),
        }
    }
}

/// Fold one change into a row's state; `None` means deleted.
pub fn apply_change(state: &mut Option<Row>, change: &RowChange) {
    match change {
        RowChange::Update(cells) => {
            if let Some(row) = state {
                for (id, value) in cells {
                    row.set(*id, value.clone());
                }
            }
        }
        RowChange::Delete => *state = None,
        RowChange::Reinsert(row) => *state = Some(row.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_change_sequence() {
        let base: Row = [(0, Value::UInt32(1)), (1, Value::UInt32(10))].into_iter().collect();
        let mut state = Some(base);

        apply_change(&mut state, &RowChange::Update(vec![(1, Value::UInt32(11))]));
        assert_eq!(state.as_ref().unwrap().get(1), Some(&Value::UInt32(11)));

        apply_change(&mut state, &RowChange::Delete);
        assert!(state.is_none());

        // Updates never resurrect a deleted row.
        apply_change(&mut state, &RowChange::Update(vec![(1, Value::UInt32(12))]));
        assert!(state.is_none());

        let again: Row = [(0, Value::UInt32(1)), (1, Value::UInt32(99))].into_iter().collect();
        apply_change(&mut state, &RowChange::Reinsert(again.clone()));
        assert_eq!(state, Some(again));
    }
}
