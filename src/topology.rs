use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Desired or applied cluster size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterState {
    pub master_count: u32,
    pub servant_count: u32,
}

impl ClusterState {
    pub fn new(master_count: u32, servant_count: u32) -> Self {
        Self {
            master_count,
            servant_count,
        }
    }

    pub fn total_count(&self) -> u64 {
        u64::from(self.master_count) + u64::from(self.servant_count)
    }

    /// With no master requested, the controller's own host is the swarm manager.
    pub fn local_is_primary(&self) -> bool {
        self.master_count == 0
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "masters={} servants={}",
            self.master_count, self.servant_count
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Servant,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Servant => "servant",
        }
    }

    /// 1-based host name used in rosters and salt targets, e.g. `servant-2`.
    pub fn host_name(self, index: usize) -> String {
        format!("{}-{}", self.as_str(), index + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
    #[serde(rename = "ip")]
    pub public: String,
    #[serde(rename = "private_ip")]
    pub private: String,
}

/// Addresses reported by the provisioner. Index `i` of each list is the same host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionOutput {
    pub masters: Vec<NodeAddr>,
    pub servants: Vec<NodeAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputParseError {
    NotAnObject,
    MissingField {
        field: &'static str,
    },
    InvalidField {
        field: &'static str,
    },
    LengthMismatch {
        role: NodeRole,
        public: usize,
        private: usize,
    },
    CountMismatch {
        role: NodeRole,
        expected: u32,
        got: usize,
    },
}

impl std::fmt::Display for OutputParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "provisioner output is not a json object"),
            Self::MissingField { field } => write!(f, "provisioner output missing {field}"),
            Self::InvalidField { field } => {
                write!(f, "provisioner output field {field} is not a list of strings")
            }
            Self::LengthMismatch {
                role,
                public,
                private,
            } => write!(
                f,
                "{} addresses mismatch: {public} public vs {private} private",
                role.as_str()
            ),
            Self::CountMismatch {
                role,
                expected,
                got,
            } => write!(
                f,
                "expected {expected} {} nodes, provisioner reported {got}",
                role.as_str()
            ),
        }
    }
}

impl std::error::Error for OutputParseError {}

const MASTER_PUBLIC: &str = "master_ip_addresses";
const MASTER_PRIVATE: &str = "master_private_ip_addresses";
const SERVANT_PUBLIC: &str = "servant_ip_addresses";
const SERVANT_PRIVATE: &str = "servant_private_ip_addresses";

impl ProvisionOutput {
    /// Parses `terraform output -json` and checks it against the requested topology.
    pub fn from_terraform_json(
        raw: &Value,
        target: ClusterState,
    ) -> Result<Self, OutputParseError> {
        let obj = raw.as_object().ok_or(OutputParseError::NotAnObject)?;
        let masters = zip_role(
            NodeRole::Master,
            output_list(obj, MASTER_PUBLIC)?,
            output_list(obj, MASTER_PRIVATE)?,
        )?;
        let servants = zip_role(
            NodeRole::Servant,
            output_list(obj, SERVANT_PUBLIC)?,
            output_list(obj, SERVANT_PRIVATE)?,
        )?;

        let out = Self { masters, servants };
        out.check_shape(target)?;
        Ok(out)
    }

    pub fn check_shape(&self, target: ClusterState) -> Result<(), OutputParseError> {
        for (role, expected, got) in [
            (NodeRole::Master, target.master_count, self.masters.len()),
            (NodeRole::Servant, target.servant_count, self.servants.len()),
        ] {
            if usize::try_from(expected).ok() != Some(got) {
                return Err(OutputParseError::CountMismatch {
                    role,
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }

    /// `(host name, role, address)` for every node, masters first.
    pub fn hosts(&self) -> impl Iterator<Item = (String, NodeRole, &NodeAddr)> + '_ {
        let masters = self
            .masters
            .iter()
            .enumerate()
            .map(|(i, a)| (NodeRole::Master.host_name(i), NodeRole::Master, a));
        let servants = self
            .servants
            .iter()
            .enumerate()
            .map(|(i, a)| (NodeRole::Servant.host_name(i), NodeRole::Servant, a));
        masters.chain(servants)
    }
}

fn output_list(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, OutputParseError> {
    let entry = obj
        .get(field)
        .ok_or(OutputParseError::MissingField { field })?;
    // Terraform wraps every output as `{"value": ..., "type": ..., "sensitive": ...}`.
    let list = entry
        .get("value")
        .and_then(Value::as_array)
        .ok_or(OutputParseError::InvalidField { field })?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or(OutputParseError::InvalidField { field })
        })
        .collect()
}

fn zip_role(
    role: NodeRole,
    public: Vec<String>,
    private: Vec<String>,
) -> Result<Vec<NodeAddr>, OutputParseError> {
    if public.len() != private.len() {
        return Err(OutputParseError::LengthMismatch {
            role,
            public: public.len(),
            private: private.len(),
        });
    }
    Ok(public
        .into_iter()
        .zip(private)
        .map(|(public, private)| NodeAddr { public, private })
        .collect())
}

/// Who callers should treat as the swarm manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryNode {
    Local,
    Remote(String),
}

impl PrimaryNode {
    pub fn for_output(target: ClusterState, output: &ProvisionOutput) -> Self {
        if target.local_is_primary() {
            return Self::Local;
        }
        match output.masters.first() {
            Some(addr) => Self::Remote(addr.public.clone()),
            None => Self::Local,
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Remote(addr) => Some(addr),
        }
    }
}
