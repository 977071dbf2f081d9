use crate::catalog::schema::{SequenceOptions, TableName};
use crate::error::SchemataError;

/// Width of the inclusive `[min, max]` range. Ranges wider than `i64::MAX`
/// fold through `i128`, which is exact for every `i64` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeWidth {
    Native(i64),
    Wide(i128),
}

/// Maps a raw engine counter onto logical sequence values. Holds no
/// counter of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    name: TableName,
    options: SequenceOptions,
    width: RangeWidth,
}

impl Sequence {
    pub fn new(name: TableName, options: SequenceOptions) -> Result<Self, SchemataError> {
        if options.increment == 0 {
            return Err(SchemataError::Validation(format!(
                "sequence {name} increment must not be zero"
            )));
        }
        if options.min > options.max {
            return Err(SchemataError::Validation(format!(
                "sequence {name} min {} exceeds max {}",
                options.min, options.max
            )));
        }
        if options.start < options.min || options.start > options.max {
            return Err(SchemataError::Validation(format!(
                "sequence {name} start {} is outside [{}, {}]",
                options.start, options.min, options.max
            )));
        }
        let width = match options
            .max
            .checked_sub(options.min)
            .and_then(|d| d.checked_add(1))
        {
            Some(w) => RangeWidth::Native(w),
            None => RangeWidth::Wide(i128::from(options.max) - i128::from(options.min) + 1),
        };
        Ok(Self {
            name,
            options,
            width,
        })
    }

    pub fn name(&self) -> &TableName {
        &self.name
    }

    pub fn options(&self) -> &SequenceOptions {
        &self.options
    }

    /// Logical value for a freshly incremented raw counter.
    pub fn next_value(&self, raw: i64) -> Result<i64, SchemataError> {
        let value = self.not_cycled(raw);
        if self.in_range(value) {
            return narrow(value, &self.name);
        }
        if !self.options.cycle {
            return Err(SchemataError::SequenceLimitExceeded {
                sequence: self.name.to_string(),
                value,
            });
        }
        Ok(self.fold(value))
    }

    /// Logical value for the current raw counter. Without cycling the
    /// value is reported unchecked, so a counter that has not been
    /// incremented yet yields `start - increment`.
    pub fn current_value(&self, raw: i64) -> Result<i64, SchemataError> {
        let value = self.not_cycled(raw);
        if self.options.cycle {
            return Ok(self.fold(value));
        }
        narrow(value, &self.name)
    }

    fn not_cycled(&self, raw: i64) -> i128 {
        i128::from(self.options.start)
            + (i128::from(raw) - 1) * i128::from(self.options.increment)
    }

    fn in_range(&self, value: i128) -> bool {
        value >= i128::from(self.options.min) && value <= i128::from(self.options.max)
    }

    fn fold(&self, value: i128) -> i64 {
        let min = self.options.min;
        match self.width {
            RangeWidth::Native(width) => {
                if let Some(offset) = i64::try_from(value)
                    .ok()
                    .and_then(|v| v.checked_sub(min))
                {
                    return min + offset.rem_euclid(width);
                }
                fold_wide(value, min, i128::from(width))
            }
            RangeWidth::Wide(width) => fold_wide(value, min, width),
        }
    }
}

fn fold_wide(value: i128, min: i64, width: i128) -> i64 {
    let folded = i128::from(min) + (value - i128::from(min)).rem_euclid(width);
    // folded lies in [min, max], both of which are i64.
    i64::try_from(folded).unwrap_or(min)
}

fn narrow(value: i128, name: &TableName) -> Result<i64, SchemataError> {
    i64::try_from(value).map_err(|_| SchemataError::SequenceLimitExceeded {
        sequence: name.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::Sequence;
    use crate::catalog::schema::{SequenceOptions, TableName};
    use proptest::prelude::*;

    fn seq(start: i64, increment: i64, min: i64, max: i64, cycle: bool) -> Sequence {
        Sequence::new(
            TableName::new("s", "seq"),
            SequenceOptions {
                start,
                increment,
                min,
                max,
                cycle,
            },
        )
        .expect("valid sequence")
    }

    #[test]
    fn small_cycle_repeats() {
        let s = seq(1, 1, 1, 3, true);
        let values: Vec<i64> = (1..=6).map(|raw| s.next_value(raw).expect("value")).collect();
        assert_eq!(values, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn no_cycle_reports_range_exceeded() {
        let s = seq(1, 1, 1, 3, false);
        assert_eq!(s.next_value(3).expect("in range"), 3);
        let err = s.next_value(4).expect_err("out of range");
        assert_eq!(err.code_str(), "sequence_limit_exceeded");
    }

    #[test]
    fn descending_cycle_wraps_to_max() {
        let s = seq(3, -1, 1, 3, true);
        let values: Vec<i64> = (1..=4).map(|raw| s.next_value(raw).expect("value")).collect();
        assert_eq!(values, vec![3, 2, 1, 3]);
    }

    #[test]
    fn current_value_before_first_increment() {
        let s = seq(10, 5, 0, 100, false);
        assert_eq!(s.current_value(0).expect("current"), 5);
        assert_eq!(s.current_value(1).expect("current"), 10);
    }

    #[test]
    fn full_width_range_folds_through_wide_path() {
        let s = seq(i64::MAX, 1, i64::MIN, i64::MAX, true);
        assert_eq!(s.next_value(1).expect("first"), i64::MAX);
        assert_eq!(s.next_value(2).expect("wrapped"), i64::MIN);
        assert_eq!(s.next_value(3).expect("next"), i64::MIN + 1);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let name = TableName::new("s", "bad");
        let zero_inc = SequenceOptions {
            increment: 0,
            ..SequenceOptions::default()
        };
        assert!(Sequence::new(name.clone(), zero_inc).is_err());
        let start_outside = SequenceOptions {
            start: 0,
            ..SequenceOptions::default()
        };
        assert!(Sequence::new(name, start_outside).is_err());
    }

    fn arb_options() -> impl Strategy<Value = SequenceOptions> {
        (-1_000i64..1_000, 1i64..500, -20i64..20)
            .prop_flat_map(|(min, span, increment)| {
                let increment = if increment == 0 { 1 } else { increment };
                let max = min + span;
                (Just(min), Just(max), min..=max, Just(increment))
            })
            .prop_map(|(min, max, start, increment)| SequenceOptions {
                start,
                increment,
                min,
                max,
                cycle: true,
            })
    }

    proptest! {
        #[test]
        fn cycled_values_stay_in_range_and_repeat(options in arb_options(), raw in 1i64..10_000) {
            let s = Sequence::new(TableName::new("s", "p"), options).expect("valid");
            let width = options.max - options.min + 1;
            let value = s.next_value(raw).expect("cycled value");
            prop_assert!(value >= options.min && value <= options.max);
            prop_assert_eq!(value, s.next_value(raw + width).expect("next period"));
        }

        #[test]
        fn uncycled_values_outside_range_always_fail(options in arb_options(), raw in 1i64..10_000) {
            let options = SequenceOptions { cycle: false, ..options };
            let s = Sequence::new(TableName::new("s", "p"), options).expect("valid");
            let logical = options.start as i128 + (raw as i128 - 1) * options.increment as i128;
            let inside = logical >= options.min as i128 && logical <= options.max as i128;
            match s.next_value(raw) {
                Ok(v) => prop_assert!(inside && v as i128 == logical),
                Err(e) => prop_assert!(!inside && e.code_str() == "sequence_limit_exceeded"),
            }
        }
    }
}
