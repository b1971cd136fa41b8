use std::collections::{BTreeMap, HashMap};

use ndarray::Array2;
use polars::prelude::*;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::helper_functions::median;
use crate::models::{AlleleType, BarcodeAnnotation};
use crate::normalization::{RatioChannel, RatioTable};

/// One normalized value in long form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongObservation<'a> {
    pub barcode: usize,
    pub allele: &'a str,
    pub condition: &'a str,
    pub replicate: &'a str,
    pub value: f64,
}

/// Reshapes the ratio matrix to one row per (barcode, condition, replicate),
/// barcode-major. Non-finite values are dropped.
pub fn long_form(ratios: &RatioTable) -> Vec<LongObservation<'_>> {
    let mut out = Vec::with_capacity(ratios.values.len());
    for (barcode, annotation) in ratios.barcodes.iter().enumerate() {
        for (j, channel) in ratios.channels.iter().enumerate() {
            let value = ratios.values[[barcode, j]];
            if !value.is_finite() {
                continue;
            }
            out.push(LongObservation {
                barcode,
                allele: &annotation.allele,
                condition: &channel.condition,
                replicate: &channel.replicate,
                value,
            });
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlleleRecord {
    pub allele_id: String,
    pub construct_id: String,
    pub allele_type: AlleleType,
    pub chr: String,
    pub pos: String,
    pub ref_allele: String,
    pub alt_allele: String,
    pub oligo: String,
    pub barcodes: usize,
    /// Median observation per condition.
    pub activity: BTreeMap<String, f64>,
    /// Barcode x replicate observations per condition.
    pub observations: BTreeMap<String, Vec<f64>>,
}

impl AlleleRecord {
    fn from_annotation(annotation: &BarcodeAnnotation) -> Self {
        Self {
            allele_id: annotation.allele.clone(),
            construct_id: annotation.construct.clone(),
            allele_type: annotation.allele_type.clone(),
            chr: annotation.chr.clone(),
            pos: annotation.pos.clone(),
            ref_allele: annotation.ref_allele.clone(),
            alt_allele: annotation.alt_allele.clone(),
            oligo: annotation.oligo.clone(),
            barcodes: 0,
            activity: BTreeMap::new(),
            observations: BTreeMap::new(),
        }
    }

    pub fn observations(&self, condition: &str) -> &[f64] {
        self.observations.get(condition).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// One record per distinct allele, in order of first appearance.
#[derive(Debug, Clone, PartialEq)]
pub struct AlleleTable {
    pub conditions: Vec<String>,
    pub alleles: Vec<AlleleRecord>,
}

impl AlleleTable {
    #[cfg(test)]
    pub fn get(&self, allele_id: &str) -> Option<&AlleleRecord> {
        self.alleles.iter().find(|a| a.allele_id == allele_id)
    }

    /// Allele indices grouped by construct, constructs in order of first appearance.
    pub fn constructs(&self) -> Vec<(&str, Vec<usize>)> {
        let mut order: Vec<(&str, Vec<usize>)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, allele) in self.alleles.iter().enumerate() {
            match index.get(allele.construct_id.as_str()) {
                Some(&slot) => order[slot].1.push(i),
                None => {
                    index.insert(allele.construct_id.as_str(), order.len());
                    order.push((allele.construct_id.as_str(), vec![i]));
                }
            }
        }
        order
    }

    /// Allele activity table for reporting: metadata plus activity and
    /// observation count per condition.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let mut columns = vec![
            Column::new("allele_id".into(), self.alleles.iter().map(|a| a.allele_id.clone()).collect::<Vec<_>>()),
            Column::new("construct_id".into(), self.alleles.iter().map(|a| a.construct_id.clone()).collect::<Vec<_>>()),
            Column::new("allele_type".into(), self.alleles.iter().map(|a| a.allele_type.to_string()).collect::<Vec<_>>()),
            Column::new("chr".into(), self.alleles.iter().map(|a| a.chr.clone()).collect::<Vec<_>>()),
            Column::new("pos".into(), self.alleles.iter().map(|a| a.pos.clone()).collect::<Vec<_>>()),
            Column::new("ref".into(), self.alleles.iter().map(|a| a.ref_allele.clone()).collect::<Vec<_>>()),
            Column::new("alt".into(), self.alleles.iter().map(|a| a.alt_allele.clone()).collect::<Vec<_>>()),
            Column::new("oligo".into(), self.alleles.iter().map(|a| a.oligo.clone()).collect::<Vec<_>>()),
            Column::new("barcodes".into(), self.alleles.iter().map(|a| a.barcodes as u32).collect::<Vec<_>>()),
        ];
        for condition in &self.conditions {
            let activity: Vec<Option<f64>> = self.alleles.iter().map(|a| a.activity.get(condition).copied()).collect();
            let counts: Vec<u32> = self.alleles.iter().map(|a| a.observations(condition).len() as u32).collect();
            columns.push(Column::new(format!("{condition}_activity").into(), activity));
            columns.push(Column::new(format!("{condition}_observations").into(), counts));
        }
        DataFrame::new(columns)
    }
}

/// Groups every barcode x replicate observation by allele, per condition, and
/// takes the median as the allele's activity score.
///
/// An allele id that shows up under two constructs or two allele types is a
/// broken join and aborts.
pub fn aggregate(ratios: &RatioTable) -> PipelineResult<AlleleTable> {
    let conditions = ratios.conditions();
    let mut alleles: Vec<AlleleRecord> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut barcode_slot = Vec::with_capacity(ratios.barcodes.len());

    for annotation in &ratios.barcodes {
        let slot = match index.get(annotation.allele.as_str()) {
            Some(&slot) => {
                let existing = &alleles[slot];
                if existing.construct_id != annotation.construct || existing.allele_type != annotation.allele_type {
                    return Err(PipelineError::JoinMismatch(format!(
                        "allele `{}` is listed as {} of `{}` and as {} of `{}`",
                        annotation.allele,
                        existing.allele_type,
                        existing.construct_id,
                        annotation.allele_type,
                        annotation.construct
                    )));
                }
                slot
            }
            None => {
                index.insert(annotation.allele.as_str(), alleles.len());
                alleles.push(AlleleRecord::from_annotation(annotation));
                alleles.len() - 1
            }
        };
        alleles[slot].barcodes += 1;
        barcode_slot.push(slot);
    }

    for observation in long_form(ratios) {
        let slot = barcode_slot[observation.barcode];
        alleles[slot]
            .observations
            .entry(observation.condition.to_string())
            .or_default()
            .push(observation.value);
    }

    for allele in alleles.iter_mut() {
        for (condition, values) in &allele.observations {
            if let Some(m) = median(values) {
                allele.activity.insert(condition.clone(), m);
            }
        }
    }

    info!(
        "Aggregated {} barcodes into {} alleles over {} condition(s)",
        ratios.barcodes.len(),
        alleles.len(),
        conditions.len()
    );
    Ok(AlleleTable { conditions, alleles })
}

/// Per-allele x per-replicate-column activity (median over the allele's
/// barcodes in that column). Used only for reproducibility diagnostics.
#[derive(Debug, Clone)]
pub struct ReplicateActivity {
    pub channels: Vec<RatioChannel>,
    /// NaN where an allele has no finite value in a column.
    pub values: Array2<f64>,
}

pub fn replicate_activity(ratios: &RatioTable, alleles: &AlleleTable) -> ReplicateActivity {
    let index: HashMap<&str, usize> = alleles
        .alleles
        .iter()
        .enumerate()
        .map(|(i, a)| (a.allele_id.as_str(), i))
        .collect();

    let mut buckets: Vec<Vec<Vec<f64>>> = vec![vec![Vec::new(); ratios.channels.len()]; alleles.alleles.len()];
    for (barcode, annotation) in ratios.barcodes.iter().enumerate() {
        let Some(&slot) = index.get(annotation.allele.as_str()) else {
            continue;
        };
        for j in 0..ratios.channels.len() {
            let value = ratios.values[[barcode, j]];
            if value.is_finite() {
                buckets[slot][j].push(value);
            }
        }
    }

    let values = Array2::from_shape_fn((alleles.alleles.len(), ratios.channels.len()), |(i, j)| {
        median(&buckets[i][j]).unwrap_or(f64::NAN)
    });
    debug!("Replicate activity matrix {:?}", values.dim());

    ReplicateActivity {
        channels: ratios.channels.clone(),
        values,
    }
}
