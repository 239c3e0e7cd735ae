//! Remote build machine descriptors.

use std::collections::BTreeSet;

use crate::error::{QueueError, QueueResult};
use crate::step::Step;

/// One entry of the build-machine registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    /// Connection URI, e.g. `ssh://builder@example.org`, or `localhost`.
    pub name: String,
    pub systems: BTreeSet<String>,
    pub ssh_key: Option<String>,
    pub max_jobs: u32,
    pub speed_factor: f32,
    pub supported_features: BTreeSet<String>,
    /// Features a step must require for this machine to accept it at all.
    pub mandatory_features: BTreeSet<String>,
    /// Whether this is the local machine (the only target for steps that
    /// prefer a local build).
    pub is_local: bool,
}

impl Machine {
    /// The always-present local machine.
    pub fn local(platforms: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: "localhost".into(),
            systems: platforms.into_iter().collect(),
            ssh_key: None,
            max_jobs: 1,
            speed_factor: 1.0,
            supported_features: BTreeSet::new(),
            mandatory_features: BTreeSet::new(),
            is_local: true,
        }
    }

    /// Whether this machine can run `step`: the platform must be listed,
    /// steps preferring a local build only match the local machine, every
    /// mandatory feature must be required by the step, and every required
    /// feature must be supported or mandatory.
    pub fn supports_step(&self, step: &Step) -> bool {
        let Some(platform) = step.platform() else {
            return false;
        };
        let Some(required) = step.required_system_features() else {
            return false;
        };

        if !self.systems.contains(platform) {
            return false;
        }
        if step.prefer_local_build() && !self.is_local {
            return false;
        }
        if self.mandatory_features.iter().any(|f| !required.contains(f)) {
            return false;
        }
        required
            .iter()
            .all(|f| self.supported_features.contains(f) || self.mandatory_features.contains(f))
    }
}

/// Parse a machines file: one machine per line,
///
/// ```text
/// uri system1,system2 ssh-key max-jobs speed-factor supported mandatory
/// ```
///
/// Trailing fields may be omitted; `-` leaves a field empty; `#` starts a
/// comment.
pub fn parse_machines(contents: &str) -> QueueResult<Vec<Machine>> {
    let mut machines = Vec::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();

        let field = |n: usize| fields.get(n).copied().filter(|f| *f != "-");
        let list = |n: usize| -> BTreeSet<String> {
            field(n)
                .map(|f| f.split(',').map(str::to_owned).collect())
                .unwrap_or_default()
        };
        let number = |n: usize, what: &str| -> QueueResult<Option<u32>> {
            field(n)
                .map(|f| {
                    f.parse().map_err(|_| {
                        QueueError::Machines(format!(
                            "line {}: bad {} '{}'",
                            lineno + 1,
                            what,
                            f
                        ))
                    })
                })
                .transpose()
        };

        let name = fields[0].to_owned();
        let systems = list(1);
        if systems.is_empty() {
            return Err(QueueError::Machines(format!(
                "line {}: machine '{}' lists no systems",
                lineno + 1,
                name
            )));
        }

        machines.push(Machine {
            name,
            systems,
            ssh_key: field(2).map(str::to_owned),
            max_jobs: number(3, "max-jobs")?.unwrap_or(1),
            speed_factor: number(4, "speed-factor")?.map_or(1.0, |s| s as f32),
            supported_features: list(5),
            mandatory_features: list(6),
            is_local: false,
        });
    }

    Ok(machines)
}
