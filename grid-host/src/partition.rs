//! Dividing granted nodes over the declared hosts.

/// Errors from handing out granted nodes.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// More nodes were requested than the scheduler granted.
    #[error("hosts requested {requested} nodes but only {granted} were granted")]
    Shortfall {
        /// Sum of the per-host node counts.
        requested: usize,
        /// Number of nodes the scheduler granted.
        granted: usize,
    },

    /// Granted nodes were left over after every request was satisfied.
    #[error("{leftover} granted nodes were never assigned to a host")]
    Leftover {
        /// Nodes that no host claimed.
        leftover: usize,
    },
}

/// Split `nodes` into contiguous subsets of the requested sizes.
///
/// Subsets come out in request order, covering the granted nodes exactly:
/// a shortfall or leftover is an error, since either means the reservation
/// and the host declarations disagree.
pub fn partition_nodes(
    nodes: &[String],
    requests: &[usize],
) -> Result<Vec<Vec<String>>, PartitionError> {
    let requested: usize = requests.iter().sum();
    if requested > nodes.len() {
        return Err(PartitionError::Shortfall {
            requested,
            granted: nodes.len(),
        });
    }
    let mut subsets = Vec::with_capacity(requests.len());
    let mut cursor = 0;
    for &count in requests {
        subsets.push(nodes[cursor..cursor + count].to_vec());
        cursor += count;
    }
    if cursor != nodes.len() {
        return Err(PartitionError::Leftover {
            leftover: nodes.len() - cursor,
        });
    }
    Ok(subsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn subsets_are_contiguous_and_ordered() {
        let granted = nodes(&["n1", "n2", "n3", "n4", "n5"]);
        let subsets = partition_nodes(&granted, &[2, 3]).unwrap();
        assert_eq!(subsets, vec![nodes(&["n1", "n2"]), nodes(&["n3", "n4", "n5"])]);
    }

    #[test]
    fn single_request_takes_everything() {
        let granted = nodes(&["n1", "n2"]);
        let subsets = partition_nodes(&granted, &[2]).unwrap();
        assert_eq!(subsets, vec![granted]);
    }

    #[test]
    fn shortfall_is_rejected() {
        let granted = nodes(&["n1", "n2"]);
        let err = partition_nodes(&granted, &[2, 1]).unwrap_err();
        assert!(matches!(
            err,
            PartitionError::Shortfall {
                requested: 3,
                granted: 2
            }
        ));
    }

    #[test]
    fn leftover_nodes_are_rejected() {
        let granted = nodes(&["n1", "n2", "n3"]);
        let err = partition_nodes(&granted, &[1, 1]).unwrap_err();
        assert!(matches!(err, PartitionError::Leftover { leftover: 1 }));
    }

    #[test]
    fn empty_requests_need_empty_grants() {
        assert!(partition_nodes(&[], &[]).unwrap().is_empty());
        let granted = nodes(&["n1"]);
        assert!(partition_nodes(&granted, &[]).is_err());
    }
}
