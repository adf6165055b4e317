//! Roles a cluster host takes on during a run.

use crate::scheduler::ReservationId;

/// Where a host stands in the shared reservation.
///
/// Every declared host starts as an unprepared master. The first one to
/// prepare is elected supervisor and owns the reservation; the others
/// become plain masters once the supervisor hands them their nodes. A
/// master with more than one node spawns a slave per extra node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Declared but not yet prepared.
    UnpreparedMaster,

    /// Elected to drive the shared reservation for the whole run.
    Supervisor {
        /// The reservation this supervisor owns.
        reservation: ReservationId,
    },

    /// Prepared host driving the first node of its subset.
    Master,

    /// Host spawned by a master to drive one extra node.
    Slave {
        /// Name of the master that spawned this slave.
        master: String,
    },
}

impl Role {
    /// True for the supervisor.
    pub fn is_supervisor(&self) -> bool {
        matches!(self, Role::Supervisor { .. })
    }

    /// True for spawned slaves.
    pub fn is_slave(&self) -> bool {
        matches!(self, Role::Slave { .. })
    }

    /// True once preparation has assigned this host a role.
    pub fn is_prepared(&self) -> bool {
        !matches!(self, Role::UnpreparedMaster)
    }

    /// The reservation, for the supervisor only.
    pub fn reservation(&self) -> Option<&ReservationId> {
        match self {
            Role::Supervisor { reservation } => Some(reservation),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::UnpreparedMaster => f.write_str("unprepared master"),
            Role::Supervisor { reservation } => {
                write!(f, "supervisor (reservation {reservation})")
            }
            Role::Master => f.write_str("master"),
            Role::Slave { master } => write!(f, "slave of {master}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_supervisor_has_a_reservation() {
        assert!(Role::UnpreparedMaster.reservation().is_none());
        assert!(Role::Master.reservation().is_none());
        assert!(Role::Slave {
            master: "clusterA".into()
        }
        .reservation()
        .is_none());
    }

    #[test]
    fn prepared_states_are_prepared() {
        assert!(!Role::UnpreparedMaster.is_prepared());
        assert!(Role::Master.is_prepared());
        assert!(Role::Slave {
            master: "clusterA".into()
        }
        .is_prepared());
    }
}
