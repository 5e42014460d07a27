//! Versioned, byte-stable prompt templates.
//!
//! Every template carries at most one `{EHR_TEXT}` placeholder. The bytes
//! before the placeholder are the *prompt prefix*: backends with prompt
//! caching (llama.cpp) require the prefix to be byte-for-byte identical
//! across calls, so its SHA-256 is recorded per run as a regression guard.
//! Editing a template is a cache-correctness change, not a cosmetic one.

use sha2::{Digest as _, Sha256};
use std::str::FromStr;

pub const EHR_PLACEHOLDER: &str = "{EHR_TEXT}";

/// A named, byte-stable template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub id: &'static str,
    pub text: &'static str,
}

impl PromptTemplate {
    /// Everything before `{EHR_TEXT}`; the whole text when there is no
    /// placeholder (Stage-1 system prompts).
    pub fn prefix(&self) -> &'static str {
        match self.text.find(EHR_PLACEHOLDER) {
            Some(idx) => &self.text[..idx],
            None => self.text,
        }
    }

    /// Cache-correctness fingerprint of the prefix bytes.
    pub fn prefix_sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.prefix().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Substitute the placeholder. Templates without one are returned as-is.
    pub fn fill(&self, ehr_text: &str) -> String {
        self.text.replace(EHR_PLACEHOLDER, ehr_text)
    }
}

// ---------------------------------------------------------------------------
// Stage-1 profiles
// ---------------------------------------------------------------------------

/// Stage-1 prompt/schema profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage1Profile {
    StringsV1,
    SgrV1,
    SgrV2,
    SgrV2Strict,
    SgrV2StrictCascade,
    SgrV2Compact,
    SgrV3,
    SgrV4,
}

impl Stage1Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage1Profile::StringsV1 => "strings_v1",
            Stage1Profile::SgrV1 => "sgr_v1",
            Stage1Profile::SgrV2 => "sgr_v2",
            Stage1Profile::SgrV2Strict => "sgr_v2_strict",
            Stage1Profile::SgrV2StrictCascade => "sgr_v2_strict_cascade",
            Stage1Profile::SgrV2Compact => "sgr_v2_compact",
            Stage1Profile::SgrV3 => "sgr_v3",
            Stage1Profile::SgrV4 => "sgr_v4",
        }
    }

    pub fn is_sgr(&self) -> bool {
        !matches!(self, Stage1Profile::StringsV1)
    }

    /// Schema file under `schemas/` for this profile.
    pub fn schema_filename(&self) -> &'static str {
        match self {
            Stage1Profile::StringsV1 => "readmission_domain_summary.schema.json",
            Stage1Profile::SgrV1 => "readmission_domain_summary_sgr_v1.schema.json",
            Stage1Profile::SgrV2 | Stage1Profile::SgrV2Compact => {
                "readmission_domain_summary_sgr_v2.schema.json"
            }
            Stage1Profile::SgrV2Strict => "readmission_domain_summary_sgr_v2_strict.schema.json",
            Stage1Profile::SgrV2StrictCascade => {
                "readmission_domain_summary_sgr_v2_strict_cascade.schema.json"
            }
            Stage1Profile::SgrV3 => "readmission_domain_summary_sgr_v3.schema.json",
            Stage1Profile::SgrV4 => "readmission_domain_summary_sgr_v4.schema.json",
        }
    }

    pub fn template(&self) -> &'static PromptTemplate {
        match self {
            Stage1Profile::StringsV1 => &STAGE1_STRINGS_V1,
            Stage1Profile::SgrV1 => &STAGE1_SGR_V1,
            Stage1Profile::SgrV2 => &STAGE1_SGR_V2,
            Stage1Profile::SgrV2Strict => &STAGE1_SGR_V2_STRICT,
            Stage1Profile::SgrV2StrictCascade => &STAGE1_SGR_V2_STRICT_CASCADE,
            Stage1Profile::SgrV2Compact => &STAGE1_SGR_V2_COMPACT,
            Stage1Profile::SgrV3 => &STAGE1_SGR_V3,
            Stage1Profile::SgrV4 => &STAGE1_SGR_V4,
        }
    }
}

impl FromStr for Stage1Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strings_v1" => Ok(Stage1Profile::StringsV1),
            "sgr_v1" => Ok(Stage1Profile::SgrV1),
            "sgr_v2" => Ok(Stage1Profile::SgrV2),
            "sgr_v2_strict" => Ok(Stage1Profile::SgrV2Strict),
            "sgr_v2_strict_cascade" => Ok(Stage1Profile::SgrV2StrictCascade),
            "sgr_v2_compact" => Ok(Stage1Profile::SgrV2Compact),
            "sgr_v3" => Ok(Stage1Profile::SgrV3),
            "sgr_v4" => Ok(Stage1Profile::SgrV4),
            other => Err(format!("unknown stage1 profile: {other}")),
        }
    }
}

pub static STAGE1_STRINGS_V1: PromptTemplate = PromptTemplate {
    id: "stage1_strings_v1",
    text: "\
## Role
You summarize one hospital discharge note into a 9-part clinical digest for 30-day readmission risk assessment.

## Output
One JSON object with exactly these 9 string keys:
DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION

Each value is a short plain-text summary of that aspect of the note.
- For any aspect not covered by the note, write exactly: not stated
- Do NOT output placeholders like ___.
- Keep each value under 400 characters.
",
};

pub static STAGE1_SGR_V1: PromptTemplate = PromptTemplate {
    id: "stage1_sgr_v1",
    text: "\
## Role
You are a clinical information extraction engine. Summarize one discharge note into a structured 9-part digest used for 30-day readmission risk scoring.

## Output
One JSON object with exactly these 9 string keys:
DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION

## Per-key format (key=value lines inside each string)
- DEMOGRAPHICS: Sex=male|female; Age=<number>
- VITALS: Heart Rate, Systolic BP, Diastolic BP, Respiratory Rate, Temperature, SpO2, Weight (numeric only)
- LABS: Hemoglobin, Hematocrit, WBC, Platelet, Sodium, Potassium, Creatinine, BUN, Glucose, Bicarbonate (numeric only)
- PROBLEMS: one diagnosis per line
- SYMPTOMS: one symptom per line
- MEDICATIONS: Medication Count, New Medications Count, Polypharmacy, Anticoagulation, Insulin Therapy, Opioid Therapy, Diuretic Therapy
- PROCEDURES: Any Procedure, Surgery, Dialysis, Mechanical Ventilation
- UTILIZATION: Prior Admissions 12mo, ED Visits 6mo, Days Since Last Admission, Current Length of Stay (numeric only)
- DISPOSITION: Discharge Disposition, Mental Status

For any missing value write exactly: not stated. Never output ___.
",
};

pub static STAGE1_SGR_V2: PromptTemplate = PromptTemplate {
    id: "stage1_sgr_v2",
    text: "\
## Role
You are a clinical information extraction engine. Read ONE hospital discharge note and produce a structured digest for 30-day readmission risk scoring.

## Output (STRICT)
One JSON object with exactly these 9 top-level keys:
DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION

## Key shapes
- DEMOGRAPHICS (string): two lines `Sex=male|female` and `Age=<number>`.
- VITALS (string): up to two lines prefixed `ADM:` and `DC:`, each a semicolon list of
  `Heart Rate=; Systolic BP=; Diastolic BP=; Respiratory Rate=; Temperature=; SpO2=; Weight=`
  with numeric-only values (no units, no %, no RA).
- LABS (string): same ADM:/DC: line shape with keys
  `Hemoglobin=; Hematocrit=; WBC=; Platelet=; Sodium=; Potassium=; Creatinine=; BUN=; Glucose=; Bicarbonate=`.
- PROBLEMS (object): four string arrays
  `pmh_comorbidities` (Past Medical History), `discharge_dx` (Discharge Diagnosis),
  `complications`, `working_dx`. One diagnosis per item, short SNOMED-style names.
- SYMPTOMS (object): two string arrays `admission` (max 3 items) and `discharge` (max 1 item).
- MEDICATIONS (string): key=value lines for
  `Medication Count, New Medications Count, Polypharmacy, Anticoagulation, Insulin Therapy, Opioid Therapy, Diuretic Therapy`
  (counts numeric; flags yes|no).
- PROCEDURES (string): key=value lines for
  `Any Procedure (yes|no), Surgery (yes|no), Dialysis (decided|started|done|cancelled|no), Mechanical Ventilation (numeric days or no)`.
- UTILIZATION (string): key=value lines for
  `Prior Admissions 12mo, ED Visits 6mo, Days Since Last Admission, Current Length of Stay` (numeric only).
- DISPOSITION (string): key=value lines for
  `Discharge Disposition (Home|Home with Services|SNF|Rehab|LTAC|Hospice|AMA)` and
  `Mental Status (alert|confused|oriented|lethargic)`.

## Hard rules
- Output ONLY the JSON object. No markdown fences, no commentary.
- For any value not present in the note, write exactly: not stated
- NEVER output placeholders like ___ or redaction tokens like [** ... **].
- If blood pressure appears as 120/80, split it into Systolic BP=120; Diastolic BP=80.
- Strip units everywhere: 98% -> 98, 78 bpm -> 78.
- Do NOT invent values. Absence of evidence means: not stated.
",
};

pub static STAGE1_SGR_V2_STRICT: PromptTemplate = PromptTemplate {
    id: "stage1_sgr_v2_strict",
    text: "\
## Role
You are a clinical information extraction engine. Read ONE hospital discharge note and produce a structured digest for 30-day readmission risk scoring.

## Output (STRICT SCHEMA MODE)
One JSON object with exactly these 9 top-level keys, no others:
DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION

Key shapes are identical to the standard digest (ADM:/DC: vitals and labs lines,
PROBLEMS object with pmh_comorbidities/discharge_dx/complications/working_dx,
SYMPTOMS object with admission/discharge). In strict mode additionally:
- Every canonical VITALS and LABS key MUST appear on the ADM: line, filled or `not stated`.
- JSON strings MUST NOT contain raw newlines except as shown; escape with \\n.
- Arrays MUST NOT contain empty strings, placeholders, or duplicate items.
- The object MUST be complete and valid JSON: close every quote and brace.
- For any value not present in the note, write exactly: not stated
- NEVER output ___ or [** ... **].
",
};

pub static STAGE1_SGR_V2_STRICT_CASCADE: PromptTemplate = PromptTemplate {
    id: "stage1_sgr_v2_strict_cascade",
    text: "\
## Role
You are a clinical information extraction engine. Read ONE hospital discharge note and produce a structured digest for 30-day readmission risk scoring.

## Output (STRICT SCHEMA MODE, EVIDENCE CASCADE)
One JSON object with exactly these 9 top-level keys, no others:
DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION

Key shapes are identical to the standard digest, with two additions:
- VITALS carries `evidence_line1..evidence_line3`: verbatim single lines from the
  note where vital signs appear (or `not stated`), plus an `admission` object
  with numeric fields heart_rate, systolic_bp, diastolic_bp, respiratory_rate,
  temperature, spo2, weight.
- LABS carries `evidence_line1..evidence_line6` plus an `admission` object with
  numeric fields hemoglobin, hematocrit, wbc, platelet, sodium, potassium,
  creatinine, bun, glucose, bicarbonate.

Copy evidence lines BEFORE filling values; fill each numeric field from its
evidence. For any value not present write exactly: not stated. Never output ___.
",
};

pub static STAGE1_SGR_V2_COMPACT: PromptTemplate = PromptTemplate {
    id: "stage1_sgr_v2_compact",
    text: "\
## Role
Clinical extraction engine: one discharge note -> one digest JSON for readmission risk.

## Output
One JSON object, 9 keys: DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION.
- DEMOGRAPHICS: `Sex=male|female` + `Age=<number>` lines.
- VITALS/LABS: `ADM:`/`DC:` lines of canonical `Key=number` pairs (no units).
- PROBLEMS: object {pmh_comorbidities, discharge_dx, complications, working_dx} (string arrays).
- SYMPTOMS: object {admission (max 3), discharge (max 1)} (string arrays).
- MEDICATIONS/PROCEDURES/UTILIZATION/DISPOSITION: canonical `Key=value` lines.
- Missing value: exactly `not stated`. Never ___.
- Split BP pairs: 120/80 -> Systolic BP=120; Diastolic BP=80.
",
};

pub static STAGE1_SGR_V3: PromptTemplate = PromptTemplate {
    id: "stage1_sgr_v3",
    text: "\
## Role
You are a clinical information extraction engine. Read ONE hospital discharge note and produce a structured digest for 30-day readmission risk scoring.

## Output (STRICT)
One JSON object with exactly these 9 top-level keys:
DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION

Key shapes follow the standard digest (ADM:/DC: vitals and labs lines, PROBLEMS
and SYMPTOMS objects). Additional constraints in this revision:
- UTILIZATION values MUST be bare integers; omit the key line entirely when the
  note carries no utilization history (do not guess 0).
- DISPOSITION Discharge Disposition MUST be one of:
  Home, Home with Services, SNF, Rehab, LTAC, Hospice, AMA.
- DISPOSITION Mental Status MUST be one of: alert, confused, oriented, lethargic.
- Phrases like `clear and coherent` map to alert.
- For any value not present in the note, write exactly: not stated. Never ___.
",
};

pub static STAGE1_SGR_V4: PromptTemplate = PromptTemplate {
    id: "stage1_sgr_v4",
    text: "\
## Role
You are a clinical information extraction engine. Read ONE hospital discharge note and produce a fully structured digest for 30-day readmission risk scoring.

## Output (FULLY STRUCTURED)
One JSON object with exactly these 9 top-level keys:
DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION

In this revision the objective clusters are objects, not strings:
- DEMOGRAPHICS: {\"sex\": \"male|female|not stated\", \"age\": \"<number>|not stated\"}
- VITALS: {\"admission\": {heart_rate, systolic_bp, diastolic_bp, respiratory_rate, temperature, spo2, weight}, \"discharge\": {...}}
- LABS: {\"admission\": {hemoglobin, hematocrit, wbc, platelet, sodium, potassium, creatinine, bun, glucose, bicarbonate}, \"discharge\": {...}}
All leaf values are strings: a bare number or exactly `not stated`.
PROBLEMS/SYMPTOMS keep the standard object shapes; the remaining clusters keep
key=value line strings. Never output ___.
",
};

// ---------------------------------------------------------------------------
// Stage-1 retry suffixes
// ---------------------------------------------------------------------------

pub const STAGE1_HYGIENE_SUFFIX: &str = "\n\nHYGIENE FIX (MANDATORY):\n\
- Output ONLY the JSON object.\n\
- NEVER output placeholders like ___ or redaction tokens like [** ... **].\n\
- For any unknown value, write exactly: not stated.\n\
- Keep the same 9 top-level keys.\n\
- Ensure JSON strings do not contain raw newlines (use \\n inside strings if needed).\n";

pub const STAGE1_COMPACT_SUFFIX: &str = "\n\nCOMPACT MODE (MANDATORY):\n\
- Output ONLY the JSON object.\n\
- For VITALS: ONLY these keys: Heart Rate, Systolic BP, Diastolic BP, Respiratory Rate, Temperature, SpO2, Weight.\n\
- For LABS: ONLY these keys: WBC, Hemoglobin, Hematocrit, Platelet, Sodium, Potassium, Creatinine, BUN, Glucose, Bicarbonate.\n\
- For any missing value, write exactly: not stated.\n\
- Do NOT include any other tests (no urine studies, tox, CMP extras, etc.).\n\
- Do NOT use placeholders like ___.\n\
- Ensure the JSON is complete and valid (close quotes/braces).\n";

pub const STAGE1_PLACEHOLDER_SUFFIX: &str = "\n\nPLACEHOLDER BAN (MANDATORY):\n\
- Output ONLY the JSON object.\n\
- Replace every \"___\" with exactly: not stated.\n\
- Do NOT invent values.\n\
- Ensure the JSON is complete and valid.\n";

// ---------------------------------------------------------------------------
// Stage-2 templates
// ---------------------------------------------------------------------------

/// Which clusters Stage 2 is asked to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage2Scope {
    Objective,
    All,
}

impl Stage2Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage2Scope::Objective => "objective",
            Stage2Scope::All => "all",
        }
    }
}

impl FromStr for Stage2Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "objective" => Ok(Stage2Scope::Objective),
            "all" => Ok(Stage2Scope::All),
            other => Err(format!("scope must be one of: objective, all (got {other})")),
        }
    }
}

/// Stage-2 raw output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage2OutputMode {
    Lines,
    Json,
}

impl Stage2OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage2OutputMode::Lines => "lines",
            Stage2OutputMode::Json => "json",
        }
    }
}

impl FromStr for Stage2OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lines" => Ok(Stage2OutputMode::Lines),
            "json" => Ok(Stage2OutputMode::Json),
            other => Err(format!("output mode must be one of: lines, json (got {other})")),
        }
    }
}

/// The Stage-2 template chosen for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage2Template {
    ObjectiveLines,
    AllLines,
    TrainingMatch,
    StrictJson,
}

impl Stage2Template {
    /// Template selection by `(output_mode, scope, training_match)`.
    /// `json` output is only defined for the objective scope.
    pub fn select(
        mode: Stage2OutputMode,
        scope: Stage2Scope,
        training_match: bool,
    ) -> Result<Stage2Template, String> {
        match (mode, scope) {
            (Stage2OutputMode::Json, Stage2Scope::Objective) => Ok(Stage2Template::StrictJson),
            (Stage2OutputMode::Json, Stage2Scope::All) => {
                Err("output mode json currently supports only scope objective".to_string())
            }
            (Stage2OutputMode::Lines, Stage2Scope::Objective) => Ok(Stage2Template::ObjectiveLines),
            (Stage2OutputMode::Lines, Stage2Scope::All) => {
                if training_match {
                    Ok(Stage2Template::TrainingMatch)
                } else {
                    Ok(Stage2Template::AllLines)
                }
            }
        }
    }

    pub fn template(&self) -> &'static PromptTemplate {
        match self {
            Stage2Template::ObjectiveLines => &STAGE2_OBJECTIVE_LINES,
            Stage2Template::AllLines => &STAGE2_ALL_LINES,
            Stage2Template::TrainingMatch => &STAGE2_TRAINING_MATCH,
            Stage2Template::StrictJson => &STAGE2_STRICT_JSON,
        }
    }
}

pub static STAGE2_OBJECTIVE_LINES: PromptTemplate = PromptTemplate {
    id: "stage2_objective_lines",
    text: "\
## Role
You convert a structured clinical digest into objective fact lines for 30-day readmission risk scoring.

## Output Format (STRICT)
Format: CLUSTER|Keyword|Value|Timestamp
Return ONLY fact lines. No headers, no markdown, no explanations, no extra text.
Finish with a single line: END

## Allowed CLUSTERS (objective only)
DEMOGRAPHICS, VITALS, LABS, UTILIZATION, DISPOSITION

## Canonical Keywords (MUST MATCH EXACTLY)
VITALS: Heart Rate, Systolic BP, Diastolic BP, Respiratory Rate, Temperature, SpO2, Weight
LABS: Hemoglobin, Hematocrit, WBC, Platelet, Sodium, Potassium, Creatinine, BUN, Glucose, Bicarbonate
DEMOGRAPHICS: Age (numeric), Sex (male|female)
UTILIZATION: Prior Admissions 12mo, ED Visits 6mo, Days Since Last Admission, Current Length of Stay
DISPOSITION: Discharge Disposition, Mental Status

## Allowed timestamps (EXACT)
Past, Admission, Discharge, Unknown

## CRITICAL rules
- Every line has exactly 3 pipe characters (4 fields).
- VITALS/LABS/UTILIZATION values are numeric only (NO units, NO words).
- At most ONE line per (CLUSTER, Keyword): prefer the Discharge value when both exist.
- Skip any keyword whose value is `not stated` — absence is NOT a fact.
- Do NOT copy this instruction text into the output.

## Clinical digest
{EHR_TEXT}

## BEGIN EXTRACTION
",
};

pub static STAGE2_ALL_LINES: PromptTemplate = PromptTemplate {
    id: "stage2_all_lines",
    text: "\
## Role
You convert a structured clinical digest into fact lines for 30-day readmission risk scoring.

## Output Format (STRICT)
Format: CLUSTER|Keyword|Value|Timestamp
Return ONLY fact lines. No headers, no markdown, no explanations, no extra text.
Finish with a single line: END

## Allowed CLUSTERS (9 total)
DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION

## Allowed timestamps (EXACT)
Past, Admission, Discharge, Unknown

## Canonical Keywords (MUST MATCH EXACTLY)
VITALS: Heart Rate, Systolic BP, Diastolic BP, Respiratory Rate, Temperature, SpO2, Weight
LABS: Hemoglobin, Hematocrit, WBC, Platelet, Sodium, Potassium, Creatinine, BUN, Glucose, Bicarbonate
DEMOGRAPHICS: Age (numeric), Sex (male|female)

## Value rules
- PROBLEMS: Value is one of exist/chronic/acute/not exist.
  - PMH/Comorbidities items -> Timestamp=Past, Value=chronic (one line per diagnosis)
  - Discharge Dx items -> Timestamp=Discharge, Value=acute (one line per diagnosis)
- SYMPTOMS: Value is one of yes/no/severe (ADM symptoms -> Admission, DC symptoms -> Discharge).
- MEDICATIONS: Medication Count (numeric), New Medications Count (numeric),
  Polypharmacy (yes/no), Anticoagulation (yes/no), Insulin Therapy (yes/no),
  Opioid Therapy (yes/no), Diuretic Therapy (yes/no).
- PROCEDURES: Any Procedure (yes/no), Surgery (yes/no),
  Dialysis (decided/started/done/cancelled/no), Mechanical Ventilation (numeric days or no).
- UTILIZATION (numeric only): Prior Admissions 12mo, ED Visits 6mo,
  Days Since Last Admission, Current Length of Stay.
- DISPOSITION: Discharge Disposition (Home, Home with Services, SNF, Rehab, LTAC, Hospice, AMA)
  and Mental Status (alert, confused, oriented, lethargic).

## CRITICAL rules
- Every line has exactly 3 pipe characters (4 fields). NEVER emit 3- or 5-field lines.
- VITALS/LABS values numeric only; at most ONE line per (CLUSTER, Keyword);
  prefer Discharge over Admission when both exist.
- Never repeat an identical line.
- Skip any keyword whose value is `not stated` — absence is NOT a fact.
- Do NOT copy this instruction text, headers, or keyword lists into the output.

## Clinical digest
{EHR_TEXT}

## BEGIN EXTRACTION
",
};

pub static STAGE2_TRAINING_MATCH: PromptTemplate = PromptTemplate {
    id: "stage2_training_match",
    text: "\
Extract readmission risk facts from the clinical digest below.

Output format: CLUSTER|Keyword|Value|Timestamp
One fact per line. End with the line END.

Clusters: DEMOGRAPHICS, VITALS, LABS, PROBLEMS, SYMPTOMS, MEDICATIONS, PROCEDURES, UTILIZATION, DISPOSITION
Timestamps: Past, Admission, Discharge, Unknown

{EHR_TEXT}

",
};

pub static STAGE2_STRICT_JSON: PromptTemplate = PromptTemplate {
    id: "stage2_strict_json",
    text: "\
## Role
You convert a structured clinical digest into objective facts for 30-day readmission risk scoring.

## Output Format (STRICT JSON)
Return ONLY one JSON object of the shape:
{\"facts\": [{\"cluster\": \"...\", \"keyword\": \"...\", \"value\": \"...\", \"timestamp\": \"...\"}]}
No markdown fences, no commentary, at most 25 facts.

## Allowed clusters (objective only)
DEMOGRAPHICS, VITALS, LABS, UTILIZATION, DISPOSITION

## Rules
- VITALS/LABS/UTILIZATION values are numeric-only strings.
- At most one fact per (cluster, keyword); prefer Discharge when both exist.
- Timestamps: Past, Admission, Discharge, Unknown (ADM/DC also accepted).
- Skip any keyword whose value is `not stated`.

## Clinical digest
{EHR_TEXT}

## BEGIN EXTRACTION
",
};

// ---------------------------------------------------------------------------
// Stage-2 retry suffixes
// ---------------------------------------------------------------------------

pub const STAGE2_FAILSAFE_LINES: &str = "\n\nFAILSAFE:\n\
- Return ONLY KVT4 lines now.\n\
- One fact per line: CLUSTER|Keyword|Value|Timestamp\n\
- No headers, no extra text.\n\
- DO NOT repeat prompt text, sections, markdown, or keyword lists.\n";

pub const STAGE2_FAILSAFE_JSON: &str =
    "\n\nFAILSAFE: Return ONLY a valid JSON object: {\"facts\": [...]} and nothing else.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_splits_at_placeholder() {
        let t = &STAGE2_ALL_LINES;
        assert!(t.prefix().contains("## Role"));
        assert!(!t.prefix().contains(EHR_PLACEHOLDER));
        assert!(!t.prefix().contains("BEGIN EXTRACTION"));
    }

    #[test]
    fn test_prefix_sha_is_stable() {
        // The fingerprint is a cache-correctness invariant: identical across
        // calls for a fixed (mode, scope, training_match).
        let a = Stage2Template::select(Stage2OutputMode::Lines, Stage2Scope::All, false)
            .unwrap()
            .template()
            .prefix_sha256();
        let b = Stage2Template::select(Stage2OutputMode::Lines, Stage2Scope::All, false)
            .unwrap()
            .template()
            .prefix_sha256();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_selection_matrix() {
        assert_eq!(
            Stage2Template::select(Stage2OutputMode::Lines, Stage2Scope::Objective, false).unwrap(),
            Stage2Template::ObjectiveLines
        );
        assert_eq!(
            Stage2Template::select(Stage2OutputMode::Lines, Stage2Scope::All, true).unwrap(),
            Stage2Template::TrainingMatch
        );
        assert_eq!(
            Stage2Template::select(Stage2OutputMode::Json, Stage2Scope::Objective, false).unwrap(),
            Stage2Template::StrictJson
        );
        assert!(Stage2Template::select(Stage2OutputMode::Json, Stage2Scope::All, false).is_err());
    }

    #[test]
    fn test_fill_replaces_placeholder() {
        let filled = STAGE2_OBJECTIVE_LINES.fill("## VITALS\nADM: Heart Rate=88");
        assert!(filled.contains("ADM: Heart Rate=88"));
        assert!(!filled.contains(EHR_PLACEHOLDER));
    }

    #[test]
    fn test_stage1_templates_have_no_placeholder() {
        for profile in [
            Stage1Profile::StringsV1,
            Stage1Profile::SgrV2,
            Stage1Profile::SgrV4,
        ] {
            let t = profile.template();
            assert_eq!(t.prefix(), t.text);
        }
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!("sgr_v2".parse::<Stage1Profile>().unwrap(), Stage1Profile::SgrV2);
        assert_eq!(
            "SGR_V2_STRICT_CASCADE".parse::<Stage1Profile>().unwrap(),
            Stage1Profile::SgrV2StrictCascade
        );
        assert!("sgr_v9".parse::<Stage1Profile>().is_err());
    }
}
