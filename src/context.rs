use std::fmt;

/// Identifies the study being processed. Passed by value into every
/// processing call instead of living in mutable loader state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StudyContext {
    pub patient_id: String,
    pub study_uid: String,
}

impl StudyContext {
    pub fn new(patient_id: impl Into<String>, study_uid: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            study_uid: study_uid.into(),
        }
    }

    pub fn series(&self, series_uid: impl Into<String>) -> SeriesContext {
        SeriesContext {
            study: self.clone(),
            series_uid: series_uid.into(),
        }
    }

    /// Ledger key for study-level anomalies.
    pub fn key(&self) -> String {
        format!("{}_{}", self.patient_id, self.study_uid)
    }
}

impl fmt::Display for StudyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.patient_id, self.study_uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesContext {
    pub study: StudyContext,
    pub series_uid: String,
}

impl SeriesContext {
    pub fn patient_id(&self) -> &str {
        &self.study.patient_id
    }

    pub fn study_uid(&self) -> &str {
        &self.study.study_uid
    }

    /// Ledger key for series-level anomalies.
    pub fn key(&self) -> String {
        format!("{}_{}", self.study.key(), self.series_uid)
    }
}

impl fmt::Display for SeriesContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.study, self.series_uid)
    }
}
