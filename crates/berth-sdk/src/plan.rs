//! Human-readable start plans.

use std::fmt;

use berth_compose::RunGraph;

/// Names of the containers a run will start, grouped by start phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    groups: Vec<Vec<String>>,
    job: String,
    image: String,
    command: Vec<String>,
}

impl RunPlan {
    /// Captures the plan of `graph`.
    #[must_use]
    pub fn new(graph: &RunGraph) -> Self {
        let job = graph.job();
        Self {
            groups: graph
                .groups()
                .iter()
                .map(|g| g.iter().map(|s| s.name().to_string()).collect())
                .collect(),
            job: job.name().to_string(),
            image: job.image().to_string(),
            command: job.command().to_vec(),
        }
    }

    /// Service names per start group.
    #[must_use]
    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    /// Every container in start order, job last.
    #[must_use]
    pub fn start_order(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flatten()
            .map(String::as_str)
            .chain(std::iter::once(self.job.as_str()))
            .collect()
    }

    /// Every container in the order a full teardown releases it.
    #[must_use]
    pub fn teardown_order(&self) -> Vec<&str> {
        let mut order = self.start_order();
        order.reverse();
        order
    }
}

impl fmt::Display for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            writeln!(f, "{}. {}", i + 1, group.join(", "))?;
        }
        write!(
            f,
            "{}. {} ({}): {}",
            self.groups.len() + 1,
            self.job,
            self.image,
            self.command.join(" ")
        )
    }
}
