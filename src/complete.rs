use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;

use crate::domain::{AcquisitionTime, Modality};
use crate::error::BidsifyError;
use crate::layout::{ScanRecord, SidecarSet};
use crate::report::PassReport;

#[derive(Debug, Clone, Copy, Default)]
pub struct CompleteOptions {
    /// Replace derived fields that already exist. Off by default, which makes
    /// a re-run leave every file byte-identical.
    pub overwrite: bool,
}

/// Fill in the gaps the converter leaves in sidecar JSON: `IntendedFor` on
/// fieldmaps, `TotalReadoutTime` where derivable, `TaskName` from filename
/// entities.
pub fn complete_pass(set: &mut SidecarSet, options: CompleteOptions) -> PassReport {
    let mut report = PassReport::new("complete");
    report.record_load_issues(set);

    let times: Vec<Option<AcquisitionTime>> = set
        .scans
        .iter()
        .map(ScanRecord::acquisition_time)
        .collect();

    // Linkage reads every scan, so plan all IntendedFor values before
    // mutating any record.
    let mut planned = Vec::new();
    for (index, scan) in set.scans.iter().enumerate() {
        if scan.modality != Modality::Fmap {
            continue;
        }
        if !options.overwrite && scan.fields.contains_key("IntendedFor") {
            continue;
        }
        planned.push((index, intended_for(index, &set.scans, &times)));
    }

    let mut linkage_failed = BTreeSet::new();
    for (index, result) in planned {
        match result {
            Ok(paths) => {
                let value = Value::Array(paths.into_iter().map(Value::String).collect());
                let scan = &mut set.scans[index];
                if scan.fields.get("IntendedFor") != Some(&value) {
                    debug!(path = %scan.display_path, "assigning IntendedFor");
                    scan.fields.insert("IntendedFor".to_string(), value);
                    scan.dirty = true;
                }
            }
            Err(err) => {
                linkage_failed.insert(index);
                report.skipped(&set.scans[index].display_path, err.to_string());
            }
        }
    }

    for (index, scan) in set.scans.iter_mut().enumerate() {
        if linkage_failed.contains(&index) {
            // Already reported skipped; leave the file untouched so the
            // artifact matches what is on disk.
            continue;
        }
        derive_readout_time(scan, options.overwrite, &mut report);
        derive_task_name(scan, options.overwrite);
        if scan.dirty {
            report.modified(&scan.display_path);
        } else {
            report.unchanged(&scan.display_path);
        }
    }

    report
}

/// Temporal bracketing: everything correctable acquired after this fieldmap,
/// up to the next fieldmap of the same series (entities ignoring `run`),
/// within the same session. An `acq-<datatype>` entity restricts the
/// fieldmap to series of that datatype.
fn intended_for(
    fmap_index: usize,
    scans: &[ScanRecord],
    times: &[Option<AcquisitionTime>],
) -> Result<Vec<String>, BidsifyError> {
    let fmap = &scans[fmap_index];
    let Some(fmap_time) = times[fmap_index] else {
        return Err(BidsifyError::LinkageAmbiguous {
            path: fmap.display_path.clone(),
            message: "fieldmap has no usable AcquisitionTime".to_string(),
        });
    };

    let mut by_time: BTreeMap<AcquisitionTime, Vec<usize>> = BTreeMap::new();
    for (index, scan) in scans.iter().enumerate() {
        if index == fmap_index {
            continue;
        }
        if !scan.modality.is_correctable() && scan.modality != Modality::Fmap {
            continue;
        }
        if scan.entities.session() != fmap.entities.session() {
            continue;
        }
        let Some(time) = times[index] else {
            return Err(BidsifyError::LinkageAmbiguous {
                path: fmap.display_path.clone(),
                message: format!("{} has no usable AcquisitionTime", scan.display_path),
            });
        };
        if time <= fmap_time {
            continue;
        }
        by_time.entry(time).or_default().push(index);
    }

    let mut intended = Vec::new();
    for group in by_time.values() {
        if let Some(acq) = fmap.entities.acquisition() {
            if group
                .iter()
                .any(|&index| scans[index].modality.dir_name() != acq)
            {
                continue;
            }
        }
        if group
            .iter()
            .any(|&index| scans[index].modality == Modality::Fmap)
        {
            // The next fieldmap of the same series closes the window; an
            // unrelated fieldmap does not.
            if group
                .iter()
                .any(|&index| fmap.entities.same_series_ignoring_run(&scans[index].entities))
            {
                break;
            }
            continue;
        }
        let mut paths: Vec<String> = group
            .iter()
            .map(|&index| scans[index].relative_image_path.to_string())
            .collect();
        paths.sort();
        intended.extend(paths);
    }

    intended.sort();
    Ok(intended)
}

fn derive_readout_time(scan: &mut ScanRecord, overwrite: bool, report: &mut PassReport) {
    if !overwrite && scan.fields.contains_key("TotalReadoutTime") {
        return;
    }
    let echo_spacing = scan
        .fields
        .get("EffectiveEchoSpacing")
        .and_then(Value::as_f64);
    let recon_pe = scan.fields.get("ReconMatrixPE").and_then(Value::as_f64);
    match (echo_spacing, recon_pe) {
        (Some(echo_spacing), Some(recon_pe)) => {
            let Some(number) = serde_json::Number::from_f64(echo_spacing * (recon_pe - 1.0))
            else {
                return;
            };
            let value = Value::Number(number);
            if scan.fields.get("TotalReadoutTime") != Some(&value) {
                scan.fields.insert("TotalReadoutTime".to_string(), value);
                scan.dirty = true;
            }
        }
        (Some(_), None) => report.warn(format!(
            "{}: TotalReadoutTime left undetermined, ReconMatrixPE missing",
            scan.display_path
        )),
        (None, Some(_)) => report.warn(format!(
            "{}: TotalReadoutTime left undetermined, EffectiveEchoSpacing missing",
            scan.display_path
        )),
        (None, None) => {}
    }
}

fn derive_task_name(scan: &mut ScanRecord, overwrite: bool) {
    let Some(task) = scan.entities.task() else {
        return;
    };
    if !overwrite && scan.fields.contains_key("TaskName") {
        return;
    }
    let value = Value::String(task.to_string());
    if scan.fields.get("TaskName") != Some(&value) {
        scan.fields.insert("TaskName".to_string(), value);
        scan.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;
    use serde_json::json;

    use super::*;
    use crate::domain::ScanEntities;

    fn record(modality: Modality, name: &str, fields: serde_json::Value) -> ScanRecord {
        let Value::Object(fields) = fields else {
            panic!("fixture fields must be an object");
        };
        let dir = modality.dir_name();
        let sidecar_name = name.replace(".nii.gz", ".json");
        ScanRecord {
            image_path: Utf8PathBuf::from(format!("/bids/sub-01/{dir}/{name}")),
            sidecar_path: Utf8PathBuf::from(format!("/bids/sub-01/{dir}/{sidecar_name}")),
            display_path: Utf8PathBuf::from(format!("sub-01/{dir}/{sidecar_name}")),
            relative_image_path: Utf8PathBuf::from(format!("{dir}/{name}")),
            modality,
            entities: ScanEntities::parse(name),
            fields,
            dirty: false,
        }
    }

    fn set_of(scans: Vec<ScanRecord>) -> SidecarSet {
        SidecarSet {
            scans,
            ..SidecarSet::default()
        }
    }

    fn intended_of(scan: &ScanRecord) -> Vec<String> {
        scan.fields["IntendedFor"]
            .as_array()
            .unwrap()
            .iter()
            .map(|value| value.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn fieldmap_brackets_following_series() {
        let mut set = set_of(vec![
            record(
                Modality::Fmap,
                "sub-01_dir-AP_run-01_epi.nii.gz",
                json!({"AcquisitionTime": "10:00:00.000000"}),
            ),
            record(
                Modality::Func,
                "sub-01_task-rest_bold.nii.gz",
                json!({"AcquisitionTime": "10:05:00.000000"}),
            ),
            record(
                Modality::Dwi,
                "sub-01_dwi.nii.gz",
                json!({"AcquisitionTime": "10:10:00.000000"}),
            ),
            record(
                Modality::Fmap,
                "sub-01_dir-AP_run-02_epi.nii.gz",
                json!({"AcquisitionTime": "10:15:00.000000"}),
            ),
            record(
                Modality::Func,
                "sub-01_task-nback_bold.nii.gz",
                json!({"AcquisitionTime": "10:20:00.000000"}),
            ),
        ]);

        let report = complete_pass(&mut set, CompleteOptions::default());
        assert!(!report.has_failures());

        assert_eq!(
            intended_of(&set.scans[0]),
            vec![
                "dwi/sub-01_dwi.nii.gz".to_string(),
                "func/sub-01_task-rest_bold.nii.gz".to_string(),
            ]
        );
        assert_eq!(
            intended_of(&set.scans[3]),
            vec!["func/sub-01_task-nback_bold.nii.gz".to_string()]
        );
    }

    #[test]
    fn unrelated_fieldmap_does_not_close_window() {
        let mut set = set_of(vec![
            record(
                Modality::Fmap,
                "sub-01_dir-AP_epi.nii.gz",
                json!({"AcquisitionTime": "10:00:00.000000"}),
            ),
            record(
                Modality::Fmap,
                "sub-01_dir-PA_epi.nii.gz",
                json!({"AcquisitionTime": "10:01:00.000000"}),
            ),
            record(
                Modality::Func,
                "sub-01_task-rest_bold.nii.gz",
                json!({"AcquisitionTime": "10:05:00.000000"}),
            ),
        ]);

        complete_pass(&mut set, CompleteOptions::default());

        assert_eq!(
            intended_of(&set.scans[0]),
            vec!["func/sub-01_task-rest_bold.nii.gz".to_string()]
        );
        assert_eq!(
            intended_of(&set.scans[1]),
            vec!["func/sub-01_task-rest_bold.nii.gz".to_string()]
        );
    }

    #[test]
    fn sessions_do_not_cross_link() {
        let mut set = set_of(vec![
            record(
                Modality::Fmap,
                "sub-01_ses-1_dir-AP_epi.nii.gz",
                json!({"AcquisitionTime": "10:00:00.000000"}),
            ),
            record(
                Modality::Func,
                "sub-01_ses-2_task-rest_bold.nii.gz",
                json!({"AcquisitionTime": "10:05:00.000000"}),
            ),
        ]);

        complete_pass(&mut set, CompleteOptions::default());
        assert!(intended_of(&set.scans[0]).is_empty());
    }

    #[test]
    fn missing_fieldmap_time_is_ambiguous() {
        let mut set = set_of(vec![
            record(Modality::Fmap, "sub-01_dir-AP_epi.nii.gz", json!({})),
            record(
                Modality::Func,
                "sub-01_task-rest_bold.nii.gz",
                json!({"AcquisitionTime": "10:05:00.000000"}),
            ),
        ]);

        let report = complete_pass(&mut set, CompleteOptions::default());
        assert!(report.has_failures());
        assert!(!set.scans[0].fields.contains_key("IntendedFor"));
    }

    #[test]
    fn unordered_candidate_is_ambiguous() {
        let mut set = set_of(vec![
            record(
                Modality::Fmap,
                "sub-01_dir-AP_epi.nii.gz",
                json!({"AcquisitionTime": "10:00:00.000000"}),
            ),
            record(Modality::Func, "sub-01_task-rest_bold.nii.gz", json!({})),
        ]);

        let report = complete_pass(&mut set, CompleteOptions::default());
        assert!(report.has_failures());
    }

    #[test]
    fn existing_intended_for_is_kept_without_overwrite() {
        let existing = json!({
            "AcquisitionTime": "10:00:00.000000",
            "IntendedFor": ["func/sub-01_task-old_bold.nii.gz"]
        });
        let mut set = set_of(vec![
            record(Modality::Fmap, "sub-01_dir-AP_epi.nii.gz", existing),
            record(
                Modality::Func,
                "sub-01_task-rest_bold.nii.gz",
                json!({"AcquisitionTime": "10:05:00.000000"}),
            ),
        ]);

        complete_pass(&mut set, CompleteOptions::default());
        assert_eq!(
            intended_of(&set.scans[0]),
            vec!["func/sub-01_task-old_bold.nii.gz".to_string()]
        );
        assert!(!set.scans[0].dirty);

        complete_pass(&mut set, CompleteOptions { overwrite: true });
        assert_eq!(
            intended_of(&set.scans[0]),
            vec!["func/sub-01_task-rest_bold.nii.gz".to_string()]
        );
        assert!(set.scans[0].dirty);
    }

    #[test]
    fn readout_time_formula() {
        let mut set = set_of(vec![record(
            Modality::Func,
            "sub-01_task-rest_bold.nii.gz",
            json!({"EffectiveEchoSpacing": 0.0005, "ReconMatrixPE": 64}),
        )]);

        complete_pass(&mut set, CompleteOptions::default());
        let trt = set.scans[0].fields["TotalReadoutTime"].as_f64().unwrap();
        assert!((trt - 0.0005 * 63.0).abs() < 1e-12);
    }

    #[test]
    fn readout_time_never_fabricated() {
        let mut set = set_of(vec![record(
            Modality::Func,
            "sub-01_task-rest_bold.nii.gz",
            json!({"EffectiveEchoSpacing": 0.0005}),
        )]);

        let report = complete_pass(&mut set, CompleteOptions::default());
        assert!(!set.scans[0].fields.contains_key("TotalReadoutTime"));
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn existing_readout_time_untouched_without_overwrite() {
        let mut set = set_of(vec![record(
            Modality::Dwi,
            "sub-01_dwi.nii.gz",
            json!({
                "EffectiveEchoSpacing": 0.0005,
                "ReconMatrixPE": 64,
                "TotalReadoutTime": 0.999
            }),
        )]);

        complete_pass(&mut set, CompleteOptions::default());
        assert_eq!(
            set.scans[0].fields["TotalReadoutTime"].as_f64().unwrap(),
            0.999
        );
        assert!(!set.scans[0].dirty);
    }

    #[test]
    fn linkage_failed_fieldmap_stays_untouched() {
        let mut set = set_of(vec![
            record(
                Modality::Fmap,
                "sub-01_dir-AP_epi.nii.gz",
                json!({"EffectiveEchoSpacing": 0.0005, "ReconMatrixPE": 64}),
            ),
            record(
                Modality::Func,
                "sub-01_task-rest_bold.nii.gz",
                json!({"AcquisitionTime": "10:05:00.000000"}),
            ),
        ]);

        let report = complete_pass(&mut set, CompleteOptions::default());
        assert!(report.has_failures());

        // The fieldmap is reported skipped, so nothing may be written to it,
        // derivable readout time included.
        let fmap = &set.scans[0];
        assert!(!fmap.dirty);
        assert!(!fmap.fields.contains_key("TotalReadoutTime"));
        assert_eq!(
            report
                .outcomes
                .iter()
                .filter(|outcome| outcome.path.contains("fmap"))
                .count(),
            1
        );
    }

    #[test]
    fn task_name_from_filename() {
        let mut set = set_of(vec![record(
            Modality::Func,
            "sub-01_task-rest_bold.nii.gz",
            json!({}),
        )]);

        complete_pass(&mut set, CompleteOptions::default());
        assert_eq!(set.scans[0].fields["TaskName"], json!("rest"));
    }

    #[test]
    fn linkage_error_variant() {
        let scans = vec![record(Modality::Fmap, "sub-01_dir-AP_epi.nii.gz", json!({}))];
        let times = vec![None];
        let err = intended_for(0, &scans, &times).unwrap_err();
        assert_matches!(err, BidsifyError::LinkageAmbiguous { .. });
    }
}
