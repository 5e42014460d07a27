//! Cross-cluster interaction patterns.
//!
//! Eight named clinical patterns. Each gates on specific keywords, adds a
//! fixed bonus, and carries a human-readable evidence string. Bonuses sum
//! without a cap and are added to the composite score.

use crate::engine::RiskEngine;
use crate::parse::FactSet;
use crate::report::InteractionResult;
use sc_core::Cluster;
use std::collections::HashSet;

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) => {
            if x.fract() == 0.0 {
                format!("{}", x as i64)
            } else {
                format!("{x}")
            }
        }
        None => "-".to_string(),
    }
}

fn has_symptom_group(engine: &RiskEngine, facts: &FactSet, group_id: &str) -> bool {
    facts.cluster(Cluster::Symptoms).iter().any(|f| {
        let val = f.value.as_key();
        (val == "yes" || val == "severe")
            && engine
                .symptom_index()
                .match_group(&f.keyword)
                .map(|g| g.id == group_id)
                .unwrap_or(false)
    })
}

fn has_problem_group(engine: &RiskEngine, facts: &FactSet, group_id: &str) -> bool {
    facts.cluster(Cluster::Problems).iter().any(|f| {
        let val = f.value.as_key();
        matches!(val.as_str(), "chronic" | "acute" | "exist")
            && engine
                .problem_index()
                .match_group(&f.keyword)
                .map(|g| g.id == group_id)
                .unwrap_or(false)
    })
}

fn active_problem_group_count(engine: &RiskEngine, facts: &FactSet) -> usize {
    let mut groups: HashSet<String> = HashSet::new();
    for f in facts.cluster(Cluster::Problems) {
        let val = f.value.as_key();
        if !matches!(val.as_str(), "chronic" | "acute" | "exist") {
            continue;
        }
        if let Some(g) = engine.problem_index().match_group(&f.keyword) {
            groups.insert(g.id.clone());
        }
    }
    groups.len()
}

/// Detect all triggered patterns over the parsed fact set.
pub fn detect_interactions(engine: &RiskEngine, facts: &FactSet) -> Vec<InteractionResult> {
    let mut results: Vec<InteractionResult> = Vec::new();

    let hr = facts.number(Cluster::Vitals, "Heart Rate");
    let sbp = facts.number(Cluster::Vitals, "Systolic BP");
    let rr = facts.number(Cluster::Vitals, "Respiratory Rate");
    let temp = facts.number(Cluster::Vitals, "Temperature");
    let spo2 = facts.number(Cluster::Vitals, "SpO2");

    let wbc = facts.number(Cluster::Labs, "WBC");
    let cr = facts.number(Cluster::Labs, "Creatinine");
    let bun = facts.number(Cluster::Labs, "BUN");
    let k = facts.number(Cluster::Labs, "Potassium");
    let na = facts.number(Cluster::Labs, "Sodium");
    let bicarb = facts.number(Cluster::Labs, "Bicarbonate");
    let glucose = facts.number(Cluster::Labs, "Glucose");
    let hgb = facts.number(Cluster::Labs, "Hemoglobin");
    let plt = facts.number(Cluster::Labs, "Platelet");

    let age = facts.number(Cluster::Demographics, "Age");
    let mental = facts.text(Cluster::Disposition, "Mental Status");
    let disp = facts.text(Cluster::Disposition, "Discharge Disposition");
    let anticoag = facts.text(Cluster::Medications, "Anticoagulation");

    // Sepsis / SIRS: tachycardia plus a hemodynamic sign plus an
    // infection sign.
    if let Some(hr_v) = hr {
        if hr_v > 100.0 {
            let has_hemodynamic =
                sbp.map(|v| v < 100.0).unwrap_or(false) || rr.map(|v| v > 22.0).unwrap_or(false);
            let has_infection = wbc.map(|v| v > 12.0 || v < 4.0).unwrap_or(false)
                || temp.map(|v| v > 100.4).unwrap_or(false);
            if has_hemodynamic && has_infection {
                results.push(InteractionResult {
                    pattern_id: "sepsis_pattern".into(),
                    pattern_name: "Sepsis / SIRS Pattern".into(),
                    bonus: 10,
                    description: format!(
                        "HR={}, SBP={}, RR={}, WBC={}, Temp={}",
                        fmt_opt(hr),
                        fmt_opt(sbp),
                        fmt_opt(rr),
                        fmt_opt(wbc),
                        fmt_opt(temp)
                    ),
                });
            }
        }
    }

    // Acute kidney injury: elevated creatinine and BUN plus an electrolyte
    // disturbance.
    if cr.map(|v| v > 1.5).unwrap_or(false) && bun.map(|v| v > 30.0).unwrap_or(false) {
        let has_electrolyte = k.map(|v| v > 5.0).unwrap_or(false)
            || na.map(|v| v < 135.0).unwrap_or(false)
            || bicarb.map(|v| v < 22.0).unwrap_or(false);
        if has_electrolyte {
            results.push(InteractionResult {
                pattern_id: "aki_pattern".into(),
                pattern_name: "Acute Kidney Injury Pattern".into(),
                bonus: 8,
                description: format!(
                    "Cr={}, BUN={}, K={}, Na={}, Bicarb={}",
                    fmt_opt(cr),
                    fmt_opt(bun),
                    fmt_opt(k),
                    fmt_opt(na),
                    fmt_opt(bicarb)
                ),
            });
        }
    }

    // Decompensated heart failure: known HF plus a decompensation sign.
    if has_problem_group(engine, facts, "heart_failure") {
        let has_decomp = has_symptom_group(engine, facts, "edema_fluid")
            || has_symptom_group(engine, facts, "respiratory_distress")
            || bun.map(|v| v > 40.0).unwrap_or(false);
        if has_decomp {
            results.push(InteractionResult {
                pattern_id: "decompensated_hf".into(),
                pattern_name: "Decompensated Heart Failure".into(),
                bonus: 8,
                description: "Heart failure + fluid overload/dyspnea/elevated BUN".into(),
            });
        }
    }

    // Frailty syndrome: advanced age plus at least two frailty markers.
    if age.map(|v| v > 75.0).unwrap_or(false) {
        let n_groups = active_problem_group_count(engine, facts);
        let mut frailty_count = 0;
        if n_groups >= 3 {
            frailty_count += 1;
        }
        if hgb.map(|v| v < 10.0).unwrap_or(false) {
            frailty_count += 1;
        }
        if matches!(mental.as_deref(), Some("confused") | Some("lethargic")) {
            frailty_count += 1;
        }
        if matches!(disp.as_deref(), Some("snf") | Some("ltac") | Some("rehab")) {
            frailty_count += 1;
        }
        if frailty_count >= 2 {
            results.push(InteractionResult {
                pattern_id: "frailty_syndrome".into(),
                pattern_name: "Frailty Syndrome".into(),
                bonus: 6,
                description: format!(
                    "Age={}, problems={}, Hgb={}, mental={}, disp={}",
                    fmt_opt(age),
                    n_groups,
                    fmt_opt(hgb),
                    mental.as_deref().unwrap_or("-"),
                    disp.as_deref().unwrap_or("-")
                ),
            });
        }
    }

    // Unstable discharge: AMA, or altered mental status going home.
    if disp.as_deref() == Some("ama") {
        results.push(InteractionResult {
            pattern_id: "unstable_discharge".into(),
            pattern_name: "Unstable Discharge (AMA)".into(),
            bonus: 5,
            description: "Discharge Against Medical Advice".into(),
        });
    } else if matches!(mental.as_deref(), Some("confused") | Some("lethargic"))
        && matches!(disp.as_deref(), Some("home") | None)
    {
        results.push(InteractionResult {
            pattern_id: "unstable_discharge".into(),
            pattern_name: "Unstable Discharge (altered + Home)".into(),
            bonus: 5,
            description: format!(
                "Mental={}, Disposition={}",
                mental.as_deref().unwrap_or("-"),
                disp.as_deref().unwrap_or("-")
            ),
        });
    }

    // Respiratory failure: hypoxemia plus tachypnea or dyspnea.
    if spo2.map(|v| v < 92.0).unwrap_or(false) {
        let has_resp = rr.map(|v| v > 24.0).unwrap_or(false)
            || has_symptom_group(engine, facts, "respiratory_distress");
        if has_resp {
            results.push(InteractionResult {
                pattern_id: "respiratory_failure".into(),
                pattern_name: "Respiratory Failure Pattern".into(),
                bonus: 6,
                description: format!("SpO2={}, RR={}", fmt_opt(spo2), fmt_opt(rr)),
            });
        }
    }

    // Metabolic crisis: marked hyperglycemia plus acidosis or hyperkalemia.
    if glucose.map(|v| v > 300.0).unwrap_or(false) {
        let has_metabolic =
            bicarb.map(|v| v < 18.0).unwrap_or(false) || k.map(|v| v > 5.5).unwrap_or(false);
        if has_metabolic {
            results.push(InteractionResult {
                pattern_id: "metabolic_crisis".into(),
                pattern_name: "Metabolic Crisis (DKA/HHS)".into(),
                bonus: 6,
                description: format!(
                    "Glucose={}, Bicarb={}, K={}",
                    fmt_opt(glucose),
                    fmt_opt(bicarb),
                    fmt_opt(k)
                ),
            });
        }
    }

    // Bleeding risk: marked anemia plus thrombocytopenia or anticoagulation.
    if hgb.map(|v| v < 8.0).unwrap_or(false) {
        let has_bleed =
            plt.map(|v| v < 100.0).unwrap_or(false) || anticoag.as_deref() == Some("yes");
        if has_bleed {
            results.push(InteractionResult {
                pattern_id: "bleeding_risk".into(),
                pattern_name: "Active Bleeding Risk".into(),
                bonus: 6,
                description: format!(
                    "Hgb={}, Plt={}, Anticoag={}",
                    fmt_opt(hgb),
                    fmt_opt(plt),
                    anticoag.as_deref().unwrap_or("-")
                ),
            });
        }
    }

    results
}
