//! # Flow Topology
//!
//! Subject layout for each logical event flow. A flow owns a live subject
//! for normal traffic and a dead-letter subject for messages a consumer has
//! rejected without requeue. Keeping the dead-letter routing here separates
//! the "this message is unprocessable" decision (consumer) from the "where
//! does it go" mechanism, so consumer code carries no retry-loop
//! bookkeeping.
//!
//! Topology is infrastructure: it is declared once at process startup
//! (`NatsBus::ensure_topology`) and never mutated at runtime.

/// Subject layout for one logical event flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTopology {
    /// JetStream stream name backing the flow
    pub stream: &'static str,
    /// Subject live traffic is published to
    pub subject: &'static str,
    /// Subject rejected-without-requeue messages are redirected to.
    /// Operator surface only — no consumer logic hangs off it.
    pub dlq_subject: &'static str,
}

impl FlowTopology {
    /// All subjects the flow's stream retains.
    pub fn subjects(&self) -> Vec<String> {
        vec![self.subject.to_string(), self.dlq_subject.to_string()]
    }
}

/// Forward flow: identity publishes user registrations, portfolio consumes.
/// The dead-letter subject is owned by the rejecting (portfolio) side.
pub const USER_REGISTRATION: FlowTopology = FlowTopology {
    stream: "USER_REGISTRATION",
    subject: "identity.events.user.registered",
    dlq_subject: "portfolio.dlq.user.registered",
};

/// Compensation flow: portfolio publishes profile-creation failures,
/// identity consumes and reverses the original write.
pub const PROFILE_FAILURE: FlowTopology = FlowTopology {
    stream: "PROFILE_FAILURE",
    subject: "portfolio.events.profile.creation.failed",
    dlq_subject: "identity.dlq.profile.creation.failed",
};

/// Every flow the platform declares at startup.
pub const ALL_FLOWS: [FlowTopology; 2] = [USER_REGISTRATION, PROFILE_FAILURE];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_streams_are_distinct() {
        assert_ne!(USER_REGISTRATION.stream, PROFILE_FAILURE.stream);
        assert_ne!(USER_REGISTRATION.subject, PROFILE_FAILURE.subject);
    }

    #[test]
    fn test_dlq_subjects_are_owned_by_the_rejecting_side() {
        // Portfolio rejects registration events; identity rejects
        // compensation events.
        assert!(USER_REGISTRATION.dlq_subject.starts_with("portfolio."));
        assert!(PROFILE_FAILURE.dlq_subject.starts_with("identity."));
    }

    #[test]
    fn test_stream_retains_live_and_dead_letter_subjects() {
        let subjects = USER_REGISTRATION.subjects();
        assert_eq!(subjects.len(), 2);
        assert!(subjects.contains(&USER_REGISTRATION.subject.to_string()));
        assert!(subjects.contains(&USER_REGISTRATION.dlq_subject.to_string()));
    }
}
