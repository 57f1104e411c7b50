//! Accumulators backing COUNT/SUM/AVG/MIN/MAX in GROUP BY and HAVING.
//!
//! The engine's `Value` has no NULL and no floating-point variant, so SUM
//! and AVG both accumulate and finalize as `Value::Int64` (AVG truncates
//! like integer division) rather than promoting to a float the way SQL
//! usually does.

use crate::error::{DbError, Result};
use crate::parser::ast::AggFunc;
use crate::types::Value;

pub trait AggregateAccumulator {
    fn accumulate(&mut self, value: &Value) -> Result<()>;
    fn finalize(&self) -> Value;
}

struct Count(i64);

impl AggregateAccumulator for Count {
    fn accumulate(&mut self, _value: &Value) -> Result<()> {
        self.0 += 1;
        Ok(())
    }

    fn finalize(&self) -> Value {
        Value::Int64(self.0)
    }
}

struct Sum(i64);

impl AggregateAccumulator for Sum {
    fn accumulate(&mut self, value: &Value) -> Result<()> {
        let key = value
            .as_i64_key()
            .ok_or_else(|| DbError::InvalidField("SUM requires a numeric column".into()))?;
        self.0 += key;
        Ok(())
    }

    fn finalize(&self) -> Value {
        Value::Int64(self.0)
    }
}

struct Avg {
    sum: i64,
    count: i64,
}

impl AggregateAccumulator for Avg {
    fn accumulate(&mut self, value: &Value) -> Result<()> {
        let key = value
            .as_i64_key()
            .ok_or_else(|| DbError::InvalidField("AVG requires a numeric column".into()))?;
        self.sum += key;
        self.count += 1;
        Ok(())
    }

    fn finalize(&self) -> Value {
        if self.count == 0 {
            Value::Int64(0)
        } else {
            Value::Int64(self.sum / self.count)
        }
    }
}

struct MinMax {
    best: Option<Value>,
    want_min: bool,
}

impl AggregateAccumulator for MinMax {
    fn accumulate(&mut self, value: &Value) -> Result<()> {
        let replace = match &self.best {
            None => true,
            Some(current) => match value.compare(current) {
                Some(std::cmp::Ordering::Less) => self.want_min,
                Some(std::cmp::Ordering::Greater) => !self.want_min,
                _ => false,
            },
        };
        if replace {
            self.best = Some(value.clone());
        }
        Ok(())
    }

    fn finalize(&self) -> Value {
        self.best.clone().unwrap_or(Value::Int64(0))
    }
}

pub fn create_accumulator(func: AggFunc) -> Box<dyn AggregateAccumulator> {
    match func {
        AggFunc::Count => Box::new(Count(0)),
        AggFunc::Sum => Box::new(Sum(0)),
        AggFunc::Avg => Box::new(Avg { sum: 0, count: 0 }),
        AggFunc::Min => Box::new(MinMax {
            best: None,
            want_min: true,
        }),
        AggFunc::Max => Box::new(MinMax {
            best: None,
            want_min: false,
        }),
    }
}
