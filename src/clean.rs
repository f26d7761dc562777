use serde_json::Value;
use tracing::debug;

use crate::config::CleanConfig;
use crate::layout::SidecarSet;
use crate::report::PassReport;

/// Strip denylisted metadata from every sidecar in scope. The dcm2niix
/// `global` blob gets special treatment: keys under `global.const` are
/// hoisted to the top level when absent, then the blob itself is removed.
/// Reapplying to an already-cleaned set is a no-op.
pub fn clean_pass(set: &mut SidecarSet, config: &CleanConfig) -> PassReport {
    let mut report = PassReport::new("clean");
    report.record_load_issues(set);

    for scan in &mut set.scans {
        let mut changed = false;

        if let Some(global) = scan.fields.remove("global") {
            changed = true;
            if let Some(consts) = global.get("const").and_then(Value::as_object) {
                for (key, value) in consts {
                    if scan.fields.contains_key(key) || config.denies(key) {
                        continue;
                    }
                    scan.fields.insert(key.clone(), value.clone());
                }
            }
        }

        for key in &config.denylist {
            if scan.fields.remove(key.as_str()).is_some() {
                changed = true;
            }
        }

        if changed {
            debug!(path = %scan.display_path, "cleaned sidecar");
            scan.dirty = true;
            report.modified(&scan.display_path);
        } else {
            report.unchanged(&scan.display_path);
        }
    }

    report
}
