//! Execution descriptors attached to hosts.
//!
//! An execution says which client runs which file on which host. Hosts
//! only carry these descriptors around; actually launching the client is
//! the runner's business. Slaves inherit copies of their master's
//! executions, retargeted at the slave.

/// One planned client execution on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDescriptor {
    /// Name of the host the execution runs on.
    pub host: String,
    /// Name of the client to run.
    pub client: String,
    /// Name of the file the client works on.
    pub file: String,
    /// Parsers applied to the client's output, if any.
    pub parsers: Option<Vec<String>>,
    /// True if this execution seeds the file instead of fetching it.
    pub seeder: bool,
}

impl ExecutionDescriptor {
    /// Copy this execution onto another host.
    pub fn retarget(&self, host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_changes_only_the_host() {
        let execution = ExecutionDescriptor {
            host: "clusterA".to_string(),
            client: "leecher".to_string(),
            file: "payload.bin".to_string(),
            parsers: Some(vec!["throughput".to_string()]),
            seeder: false,
        };
        let copy = execution.retarget("clusterA!1");
        assert_eq!(copy.host, "clusterA!1");
        assert_eq!(copy.client, execution.client);
        assert_eq!(copy.file, execution.file);
        assert_eq!(copy.parsers, execution.parsers);
        assert_eq!(copy.seeder, execution.seeder);
    }
}
