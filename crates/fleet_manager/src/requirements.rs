use serde_derive::{Deserialize, Serialize};

/// Options that steer the test runner rather than the server; they are never passed to a server.
pub const RUNNER_ONLY_OPTIONS: &[&str] = &[
    "restart",
    "--restart",
    "--skip-stack-trace",
    "--skip-core-file",
    "--",
];

/// The option sets of the servers a test needs, one per server, in server order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementSet(Vec<Vec<String>>);

impl Default for RequirementSet {
    /// One server, with no options.
    fn default() -> Self {
        Self(vec![vec![]])
    }
}

impl RequirementSet {
    pub fn new(option_sets: Vec<Vec<String>>) -> Self {
        Self(option_sets)
    }

    /// `count` servers, each with no options.
    pub fn bare(count: usize) -> Self {
        Self(vec![vec![]; count])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&[String]> {
        self.0.get(index).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[String]> {
        self.0.iter().map(Vec::as_slice)
    }
}

impl<S: Into<String>> FromIterator<Vec<S>> for RequirementSet {
    fn from_iter<T: IntoIterator<Item = Vec<S>>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|set| set.into_iter().map(Into::into).collect())
                .collect(),
        )
    }
}

/// Copies a canned dataset over a server's data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLoad {
    pub dataset: String,
    pub server: usize,
}

/// Makes one server replicate from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLink {
    pub master: usize,
    pub replica: usize,
}

/// Provisioning steps a test needs beyond starting servers with options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialRequests {
    #[serde(default)]
    pub load_dataset: Vec<DatasetLoad>,
    #[serde(default)]
    pub join_cluster: Vec<ClusterLink>,
}

impl SpecialRequests {
    pub fn is_empty(&self) -> bool {
        self.load_dataset.is_empty() && self.join_cluster.is_empty()
    }

    pub fn load_dataset(mut self, dataset: impl Into<String>, server: usize) -> Self {
        self.load_dataset.push(DatasetLoad {
            dataset: dataset.into(),
            server,
        });
        self
    }

    pub fn join_cluster(mut self, master: usize, replica: usize) -> Self {
        self.join_cluster.push(ClusterLink { master, replica });
        self
    }
}

/// Whether two option lists hold the same options, regardless of order.
pub fn options_match(current: &[String], desired: &[String]) -> bool {
    let mut current: Vec<_> = current.iter().collect();
    let mut desired: Vec<_> = desired.iter().collect();
    current.sort();
    desired.sort();
    current == desired
}

/// Removes every [runner-only option][RUNNER_ONLY_OPTIONS].
pub fn strip_runner_options(options: Vec<String>) -> Vec<String> {
    options
        .into_iter()
        .filter(|opt| !RUNNER_ONLY_OPTIONS.contains(&opt.as_str()))
        .collect()
}
