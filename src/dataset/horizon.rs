//! Splitting forecast files by horizon.
//!
//! An hour-zero file is the analysis: its accumulated fields cover an empty
//! window. An hour-one file carries the first hour of accumulation, while its
//! instantaneous fields duplicate the next analysis. Each file therefore only
//! contributes one half of its fields.

use tracing::debug;

use super::Dataset;
use crate::error::MergeError;

/// A field as described by a forecast file's index.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub accumulated: bool,
}

/// The fields a file is allowed to contribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Horizon {
    Zero(Vec<String>),
    One(Vec<String>),
}

impl Horizon {
    pub fn fields(&self) -> &[String] {
        match self {
            Horizon::Zero(f) | Horizon::One(f) => f,
        }
    }
}

/// Tags the file `id`, reported at forecast hour `fxx`, with the fields it keeps.
///
/// Returns `None` for horizons other than zero and one.
pub fn classify(id: &str, fxx: u32, fields: &[Field]) -> Option<Horizon> {
    let pick = |accumulated: bool| -> Vec<String> {
        fields
            .iter()
            .filter(|f| f.accumulated == accumulated)
            .map(|f| f.name.clone())
            .collect()
    };

    let horizon = match fxx {
        0 => Horizon::Zero(pick(false)),
        1 => Horizon::One(pick(true)),
        _ => return None,
    };
    debug!("{} at f{:02} keeps {:?}", id, fxx, horizon.fields());

    Some(horizon)
}

/// Restricts each piece to its horizon's fields, joins each horizon along
/// time, then merges the two variable-disjoint halves.
pub fn recombine(pieces: Vec<(Horizon, Dataset)>) -> Result<Dataset, MergeError> {
    let mut zero = Vec::new();
    let mut one = Vec::new();

    for (horizon, mut ds) in pieces {
        ds.select_variables(horizon.fields());
        if ds.variables.is_empty() {
            continue;
        }
        match horizon {
            Horizon::Zero(_) => zero.push(ds),
            Horizon::One(_) => one.push(ds),
        }
    }

    let halves: Vec<Dataset> = [zero, one]
        .into_iter()
        .filter(|group| !group.is_empty())
        .map(Dataset::concat_time)
        .collect::<Result<_, _>>()?;

    Dataset::merge(halves)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{tests::t, Spatial};

    fn fields() -> Vec<Field> {
        vec![
            Field { name: "tmp_2_m_above_ground".into(), accumulated: false },
            Field { name: "apcp_surface".into(), accumulated: true },
        ]
    }

    fn file(time: &str) -> Dataset {
        let spatial = Spatial::Regular { lat: vec![0.0], lon: vec![0.0] };
        let mut ds = Dataset::new(vec![t(time)], spatial);
        ds.insert("tmp_2_m_above_ground", vec![280.0], None).unwrap();
        ds.insert("apcp_surface", vec![1.5], None).unwrap();
        ds
    }

    #[test]
    fn should_keep_instantaneous_fields_at_hour_zero() {
        let h = classify("a", 0, &fields()).unwrap();
        assert_eq!(h, Horizon::Zero(vec!["tmp_2_m_above_ground".into()]));
    }

    #[test]
    fn should_keep_accumulated_fields_at_hour_one() {
        let h = classify("a", 1, &fields()).unwrap();
        assert_eq!(h, Horizon::One(vec!["apcp_surface".into()]));
    }

    #[test]
    fn should_ignore_other_horizons() {
        assert_eq!(classify("a", 6, &fields()), None);
    }

    #[test]
    fn should_recombine_without_dropping_or_duplicating() {
        let pieces = vec![
            (classify("h0", 0, &fields()).unwrap(), file("2021-01-01T00:00")),
            (classify("h0", 1, &fields()).unwrap(), file("2021-01-01T00:00")),
            (classify("h1", 0, &fields()).unwrap(), file("2021-01-01T01:00")),
            (classify("h1", 1, &fields()).unwrap(), file("2021-01-01T01:00")),
        ];

        let ds = recombine(pieces).unwrap();

        assert_eq!(ds.times.len(), 2);
        assert_eq!(ds.variable_names(), vec!["apcp_surface", "tmp_2_m_above_ground"]);
        assert_eq!(ds.variables["apcp_surface"].values, vec![1.5, 1.5]);
        assert_eq!(ds.variables["tmp_2_m_above_ground"].values, vec![280.0, 280.0]);
    }

    #[test]
    fn should_recombine_when_only_one_horizon_has_fields() {
        let only_acc = vec![Field { name: "apcp_surface".into(), accumulated: true }];
        let pieces = vec![
            (classify("h0", 0, &only_acc).unwrap(), file("2021-01-01T00:00")),
            (classify("h0", 1, &only_acc).unwrap(), file("2021-01-01T00:00")),
        ];

        let ds = recombine(pieces).unwrap();

        assert_eq!(ds.variable_names(), vec!["apcp_surface"]);
    }
}
