//! Column range predicates applied to scanned rows.

use crate::error::Result;
use crate::schema::{ColumnId, ColumnSchema, Row, Schema, Value};
use crate::Error;

use std::ops::Bound;

/// Restricts one column to a range of values.
///
/// Bounds compare numerically for integer columns and byte-wise for
/// strings and binary. NULL cells never match a bounded predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRangePredicate {
    pub column: ColumnSchema,
    pub lower: Bound<Value>,
    pub upper: Bound<Value>,
}

impl ColumnRangePredicate {
    pub fn new(column: ColumnSchema, lower: Bound<Value>, upper: Bound<Value>) -> Self {
        Self {
            column,
            lower,
            upper,
        }
    }

    /// Optional inclusive lower and upper bounds.
    pub fn inclusive(column: ColumnSchema, lower: Option<Value>, upper: Option<Value>) -> Self {
        Self::new(
            column,
            lower.map_or(Bound::Unbounded, Bound::Included),
            upper.map_or(Bound::Unbounded, Bound::Included),
        )
    }

    pub fn matches(&self, value: &Value) -> bool {
        let bounded = !matches!(
            (&self.lower, &self.upper),
            (Bound::Unbounded, Bound::Unbounded)
        );
        if value.is_null() {
            return !bounded;
        }

        let above_lower = match &self.lower {
            Bound::Included(lower) => value >= lower,
            Bound::Excluded(lower) => value > lower,
            Bound::Unbounded => true,
        };
        let below_upper = match &self.upper {
            Bound::Included(upper) => value <= upper,
            Bound::Excluded(upper) => value < upper,
            Bound::Unbounded => true,
        };
        above_lower && below_upper
    }

    fn bounds(&self) -> impl Iterator<Item = &Value> {
        [&self.lower, &self.upper]
            .into_iter()
            .filter_map(|bound| match bound {
                Bound::Included(v) | Bound::Excluded(v) => Some(v),
                Bound::Unbounded => None,
            })
    }
}

/// A predicate bound to the tablet column it restricts.
#[derive(Debug, Clone)]
pub struct ResolvedPredicate {
    id: ColumnId,
    missing: Value,
    predicate: ColumnRangePredicate,
}

impl ResolvedPredicate {
    fn matches(&self, row: &Row) -> bool {
        self.predicate
            .matches(row.get(self.id).unwrap_or(&self.missing))
    }
}

/// Check predicates against the tablet schema and bind them to column ids.
pub fn resolve_predicates(
    schema: &Schema,
    predicates: &[ColumnRangePredicate],
) -> Result<Vec<ResolvedPredicate>> {
    predicates
        .iter()
        .map(|predicate| {
            let idx = schema.find_column(&predicate.column.name).ok_or_else(|| {
                Error::MismatchedSchema(format!(
                    "Predicate column {} not present in the current schema",
                    predicate.column.name
                ))
            })?;
            let col = schema.column(idx);
            if !col.equals_type(&predicate.column) {
                return Err(Error::MismatchedSchema(format!(
                    "The column '{}' must have type {} found {}",
                    col.name,
                    col.type_to_string(),
                    predicate.column.type_to_string()
                )));
            }
            for bound in predicate.bounds() {
                if bound.data_type() != Some(col.data_type) {
                    return Err(Error::MismatchedSchema(format!(
                        "Predicate bound {} does not match column {}",
                        bound, col
                    )));
                }
            }
            let id = schema.column_id(idx).ok_or_else(|| {
                Error::InvalidState("Tablet schema is missing column ids".to_string())
            })?;
            Ok(ResolvedPredicate {
                id,
                missing: col.missing_value(),
                predicate: predicate.clone(),
            })
        })
        .collect()
}

/// Drops rows that fail any predicate.
pub struct PredicateFilter<I>
where
    I: Iterator<Item = Result<(Vec<u8>, Row)>>,
{
    inner: I,
    predicates: Vec<ResolvedPredicate>,
}

impl<I> PredicateFilter<I>
where
    I: Iterator<Item = Result<(Vec<u8>, Row)>>,
{
    pub fn new(inner: I, predicates: Vec<ResolvedPredicate>) -> Self {
        Self { inner, predicates }
    }
}

impl<I> Iterator for PredicateFilter<I>
where
    I: Iterator<Item = Result<(Vec<u8>, Row)>>,
{
    type Item = Result<(Vec<u8>, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((key, row)) => {
                    if self.predicates.iter().all(|p| p.matches(&row)) {
                        return Some(Ok((key, row)));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, SchemaBuilder};

    fn schema() -> Schema {
        SchemaBuilder::new()
            .add_key_column("key", DataType::UInt32)
            .add_column("int_val", DataType::UInt32, false)
            .add_column("string_val", DataType::String, true)
            .build()
            .unwrap()
            .assign_column_ids()
            .unwrap()
    }

    fn row(key: u32, s: Option<&str>) -> Row {
        [
            (0, Value::UInt32(key)),
            (1, Value::UInt32(key * 2)),
            (2, s.map_or(Value::Null, |s| Value::String(s.to_string()))),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_inclusive_and_exclusive_bounds() {
        let col = ColumnSchema::new("key", DataType::UInt32, false);
        let inclusive =
            ColumnRangePredicate::inclusive(col.clone(), Some(Value::UInt32(51)), Some(Value::UInt32(100)));
        assert!(!inclusive.matches(&Value::UInt32(50)));
        assert!(inclusive.matches(&Value::UInt32(51)));
        assert!(inclusive.matches(&Value::UInt32(100)));
        assert!(!inclusive.matches(&Value::UInt32(101)));

        let exclusive = ColumnRangePredicate::new(
            col,
            Bound::Excluded(Value::UInt32(51)),
            Bound::Excluded(Value::UInt32(100)),
        );
        assert!(!exclusive.matches(&Value::UInt32(51)));
        assert!(exclusive.matches(&Value::UInt32(99)));
        assert!(!exclusive.matches(&Value::UInt32(100)));
    }

    #[test]
    fn test_string_bounds_and_nulls() {
        let col = ColumnSchema::new("string_val", DataType::String, true);
        let pred = ColumnRangePredicate::inclusive(
            col,
            Some(Value::String("hello 50".into())),
            Some(Value::String("hello 59".into())),
        );
        assert!(pred.matches(&Value::String("hello 55".into())));
        assert!(!pred.matches(&Value::String("hello 6".into())));
        // Byte-wise: "hello 5" sorts before "hello 50".
        assert!(!pred.matches(&Value::String("hello 5".into())));
        assert!(!pred.matches(&Value::Null));
    }

    #[test]
    fn test_filter_rows() -> Result<()> {
        let schema = schema();
        let preds = resolve_predicates(
            &schema,
            &[ColumnRangePredicate::inclusive(
                schema.column(0).clone(),
                Some(Value::UInt32(2)),
                None,
            )],
        )?;
        let input = (0..5u32).map(|k| Ok((vec![k as u8], row(k, Some("x")))));
        let keys: Vec<u8> = PredicateFilter::new(input, preds)
            .map(|r| r.map(|(k, _)| k[0]))
            .collect::<Result<_>>()?;
        assert_eq!(keys, vec![2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_resolve_rejects_bad_predicates() {
        let schema = schema();
        let missing = ColumnRangePredicate::inclusive(
            ColumnSchema::new("nope", DataType::UInt32, false),
            None,
            None,
        );
        assert!(matches!(
            resolve_predicates(&schema, &[missing]),
            Err(Error::MismatchedSchema(_))
        ));

        let wrong_bound = ColumnRangePredicate::inclusive(
            schema.column(1).clone(),
            Some(Value::String("1".into())),
            None,
        );
        assert!(matches!(
            resolve_predicates(&schema, &[wrong_bound]),
            Err(Error::MismatchedSchema(msg)) if msg.contains("does not match column")
        ));
    }
}
