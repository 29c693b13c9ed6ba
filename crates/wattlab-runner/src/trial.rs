use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Fault;

/// Load intensity of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Workload {
    Low,
    Medium,
    High,
}

impl Workload {
    pub const ALL: [Workload; 3] = [Workload::Low, Workload::Medium, Workload::High];

    /// Concurrency handed to the load generator.
    pub fn intensity(self) -> u32 {
        match self {
            Workload::Low => 25,
            Workload::Medium => 50,
            Workload::High => 100,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Workload::Low => "LOW",
            Workload::Medium => "MEDIUM",
            Workload::High => "HIGH",
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Workload {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Workload::Low),
            "MEDIUM" => Ok(Workload::Medium),
            "HIGH" => Ok(Workload::High),
            other => Err(Fault::Configuration(format!(
                "unknown workload level '{}' (expected LOW, MEDIUM or HIGH)",
                other
            ))),
        }
    }
}

/// One experiment iteration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trial {
    run_id: String,
    workload: Workload,
}

impl Trial {
    pub fn new(run_id: impl Into<String>, workload: Workload) -> Self {
        Trial {
            run_id: run_id.into(),
            workload,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workload(&self) -> Workload {
        self.workload
    }

    /// Namespace for collector output: `<run_id>-<WORKLOAD>`.
    ///
    /// Workload labels contain no `-`, so the tag splits back into its parts
    /// at the last `-` and two distinct trials never share a tag.
    pub fn file_tag(&self) -> String {
        format!("{}-{}", self.run_id, self.workload.label())
    }
}

impl fmt::Display for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] [{}]", self.run_id, self.workload)
    }
}

/// Default run identifiers: `run_0` .. `run_<count-1>`.
pub fn numbered_run_ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}{}", prefix, i)).collect()
}

/// Cross product of run ids and workloads, run-major.
pub fn run_table(run_ids: &[String], workloads: &[Workload]) -> Vec<Trial> {
    run_ids
        .iter()
        .flat_map(|run_id| workloads.iter().map(move |w| Trial::new(run_id.clone(), *w)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn workload_mapping_is_exact() {
        assert_eq!(Workload::Low.intensity(), 25);
        assert_eq!(Workload::Medium.intensity(), 50);
        assert_eq!(Workload::High.intensity(), 100);
        for w in Workload::ALL {
            assert_eq!(w.label().parse::<Workload>().expect("round trip"), w);
        }
    }

    #[test]
    fn unknown_workload_is_a_configuration_error() {
        for label in ["EXTREME", "low", "", "HIGH "] {
            match label.parse::<Workload>() {
                Err(Fault::Configuration(msg)) => assert!(msg.contains("unknown workload")),
                other => panic!("'{}' should be rejected, got {:?}", label, other),
            }
        }
    }

    #[test]
    fn file_tag_joins_run_and_workload() {
        let trial = Trial::new("run_7", Workload::High);
        assert_eq!(trial.file_tag(), "run_7-HIGH");
        assert_eq!(trial.to_string(), "[run_7] [HIGH]");
    }

    #[test]
    fn file_tags_are_unique_across_the_full_table() {
        let run_ids = numbered_run_ids("run_", 100);
        let table = run_table(&run_ids, &[Workload::High, Workload::Medium, Workload::Low]);
        assert_eq!(table.len(), 300);
        let tags: BTreeSet<String> = table.iter().map(Trial::file_tag).collect();
        assert_eq!(tags.len(), table.len());
        // Stable: rebuilding the table yields the same tags.
        let again: BTreeSet<String> = run_table(&run_ids, &Workload::ALL)
            .iter()
            .map(Trial::file_tag)
            .collect();
        assert_eq!(tags, again);
    }

    #[test]
    fn run_table_is_run_major() {
        let ids = numbered_run_ids("r", 2);
        let table = run_table(&ids, &[Workload::High, Workload::Low]);
        let order: Vec<String> = table.iter().map(Trial::file_tag).collect();
        assert_eq!(order, vec!["r0-HIGH", "r0-LOW", "r1-HIGH", "r1-LOW"]);
    }
}
