//! Conflict policy engine
//!
//! Pure decision function: given a candidate request and the other live
//! requests of its session, decide whether the candidate may be scheduled or
//! must wait in BLOCKED.
//!
//! Ordering rule: a request yields to every conflicting request that is
//! older and non-terminal, and to every conflicting request that is newer
//! but already active (CREATED or RUNNING). A newer BLOCKED request never
//! holds back an older one, so blocked chains always drain oldest first.

use serde::{Deserialize, Serialize};

use crate::models::{RequestState, RequestType};

/// Granularity at which a request conflicts with others
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestScope {
    /// Whole session
    Session { session_owner: String, session: String },
    /// One SIP and every AIP derived from it
    Sip {
        sip_entity_id: i64,
        session_owner: String,
        session: String,
    },
    /// One AIP
    Aip {
        aip_entity_id: i64,
        sip_entity_id: i64,
        session_owner: String,
        session: String,
    },
}

impl RequestScope {
    /// Scope for a request type given the references stored on the request.
    ///
    /// Falls back to the session scope when an AIP/SIP reference is missing.
    pub fn for_request(
        request_type: RequestType,
        session_owner: &str,
        session: &str,
        sip_entity_id: Option<i64>,
        aip_entity_id: Option<i64>,
    ) -> Self {
        let session_scope = || RequestScope::Session {
            session_owner: session_owner.to_string(),
            session: session.to_string(),
        };
        match request_type {
            RequestType::Ingest | RequestType::AipUpdatesCreator | RequestType::OaisDeletion => {
                session_scope()
            }
            RequestType::StorageDeletion => match sip_entity_id {
                Some(sip_entity_id) => RequestScope::Sip {
                    sip_entity_id,
                    session_owner: session_owner.to_string(),
                    session: session.to_string(),
                },
                None => session_scope(),
            },
            RequestType::AipUpdate | RequestType::AipStoreMetadata => {
                match (aip_entity_id, sip_entity_id) {
                    (Some(aip_entity_id), Some(sip_entity_id)) => RequestScope::Aip {
                        aip_entity_id,
                        sip_entity_id,
                        session_owner: session_owner.to_string(),
                        session: session.to_string(),
                    },
                    _ => session_scope(),
                }
            }
        }
    }

    fn session_key(&self) -> (&str, &str) {
        match self {
            RequestScope::Session { session_owner, session }
            | RequestScope::Sip { session_owner, session, .. }
            | RequestScope::Aip { session_owner, session, .. } => {
                (session_owner.as_str(), session.as_str())
            }
        }
    }

    /// True when both scopes can touch the same AIP
    pub fn overlaps(&self, other: &RequestScope) -> bool {
        if self.session_key() != other.session_key() {
            return false;
        }
        use RequestScope::*;
        match (self, other) {
            (Session { .. }, _) | (_, Session { .. }) => true,
            (Sip { sip_entity_id: a, .. }, Sip { sip_entity_id: b, .. }) => a == b,
            (Sip { sip_entity_id: a, .. }, Aip { sip_entity_id: b, .. })
            | (Aip { sip_entity_id: b, .. }, Sip { sip_entity_id: a, .. }) => a == b,
            (Aip { aip_entity_id: a, .. }, Aip { aip_entity_id: b, .. }) => a == b,
        }
    }
}

/// A live request as seen by the policy engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedRequest {
    pub id: i64,
    pub request_id: String,
    pub request_type: RequestType,
    pub state: RequestState,
    pub scope: RequestScope,
}

/// Policy outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block,
}

/// Request types whose live requests block `candidate`
pub fn blocking_types(candidate: RequestType) -> &'static [RequestType] {
    use RequestType::*;
    match candidate {
        Ingest => &[],
        AipUpdatesCreator => &[AipStoreMetadata, OaisDeletion, StorageDeletion, AipUpdatesCreator],
        AipUpdate => &[AipStoreMetadata, StorageDeletion, OaisDeletion],
        AipStoreMetadata => &[AipUpdate, AipUpdatesCreator, StorageDeletion, OaisDeletion],
        // deletion vs deletion never blocks
        OaisDeletion => &[AipStoreMetadata, AipUpdate, AipUpdatesCreator],
        StorageDeletion => &[AipStoreMetadata, AipUpdate, AipUpdatesCreator, OaisDeletion],
    }
}

/// True when `other` holds back a candidate of `candidate_id` position
fn takes_precedence(candidate_id: i64, other: &ScopedRequest) -> bool {
    if other.id == candidate_id || other.state.is_terminal() {
        return false;
    }
    other.id < candidate_id || other.state.is_active()
}

/// Decide whether `candidate` may be scheduled given the other live requests
pub fn can_schedule(
    candidate_id: i64,
    candidate_type: RequestType,
    candidate_scope: &RequestScope,
    existing: &[ScopedRequest],
) -> Decision {
    first_conflict(candidate_id, candidate_type, candidate_scope, existing)
        .map_or(Decision::Allow, |_| Decision::Block)
}

/// First request preventing `candidate` from running, if any
pub fn first_conflict<'a>(
    candidate_id: i64,
    candidate_type: RequestType,
    candidate_scope: &RequestScope,
    existing: &'a [ScopedRequest],
) -> Option<&'a ScopedRequest> {
    let blockers = blocking_types(candidate_type);
    if blockers.is_empty() {
        return None;
    }
    existing.iter().find(|other| {
        blockers.contains(&other.request_type)
            && takes_precedence(candidate_id, other)
            && candidate_scope.overlaps(&other.scope)
    })
}

/// Re-evaluate BLOCKED requests oldest first against a snapshot of the live
/// requests of their sessions. Returns the ids to promote to CREATED; the
/// snapshot is updated as promotions happen so one pass is enough.
pub fn resolve_blocked(blocked: &[i64], live: &mut [ScopedRequest]) -> Vec<i64> {
    let mut promoted = Vec::new();
    let mut ordered: Vec<i64> = blocked.to_vec();
    ordered.sort_unstable();

    for id in ordered {
        let Some(candidate) = live.iter().find(|r| r.id == id).cloned() else {
            continue;
        };
        if can_schedule(id, candidate.request_type, &candidate.scope, live) == Decision::Allow {
            if let Some(entry) = live.iter_mut().find(|r| r.id == id) {
                entry.state = RequestState::Created;
            }
            promoted.push(id);
        }
    }
    promoted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RequestScope {
        RequestScope::Session {
            session_owner: "owner".into(),
            session: "s1".into(),
        }
    }

    fn aip(aip_entity_id: i64, sip_entity_id: i64) -> RequestScope {
        RequestScope::Aip {
            aip_entity_id,
            sip_entity_id,
            session_owner: "owner".into(),
            session: "s1".into(),
        }
    }

    fn sip(sip_entity_id: i64) -> RequestScope {
        RequestScope::Sip {
            sip_entity_id,
            session_owner: "owner".into(),
            session: "s1".into(),
        }
    }

    fn live(id: i64, request_type: RequestType, state: RequestState, scope: RequestScope) -> ScopedRequest {
        ScopedRequest {
            id,
            request_id: format!("r{}", id),
            request_type,
            state,
            scope,
        }
    }

    #[test]
    fn test_ingest_never_blocked() {
        let existing = vec![live(1, RequestType::OaisDeletion, RequestState::Running, session())];
        assert_eq!(
            can_schedule(2, RequestType::Ingest, &session(), &existing),
            Decision::Allow
        );
    }

    #[test]
    fn test_update_blocked_by_running_store_metadata_on_same_aip() {
        let existing = vec![live(1, RequestType::AipStoreMetadata, RequestState::Running, aip(10, 1))];
        assert_eq!(
            can_schedule(2, RequestType::AipUpdate, &aip(10, 1), &existing),
            Decision::Block
        );
        assert_eq!(
            can_schedule(2, RequestType::AipUpdate, &aip(11, 1), &existing),
            Decision::Allow
        );
    }

    #[test]
    fn test_session_deletion_blocks_update_on_any_aip_of_session() {
        let existing = vec![live(1, RequestType::OaisDeletion, RequestState::Created, session())];
        assert_eq!(
            can_schedule(2, RequestType::AipUpdate, &aip(42, 7), &existing),
            Decision::Block
        );
    }

    #[test]
    fn test_other_session_never_overlaps() {
        let other = RequestScope::Session {
            session_owner: "owner".into(),
            session: "s2".into(),
        };
        let existing = vec![live(1, RequestType::OaisDeletion, RequestState::Running, other)];
        assert_eq!(
            can_schedule(2, RequestType::AipUpdate, &aip(42, 7), &existing),
            Decision::Allow
        );
    }

    #[test]
    fn test_deletion_does_not_block_deletion() {
        let existing = vec![live(1, RequestType::OaisDeletion, RequestState::Running, session())];
        assert_eq!(
            can_schedule(2, RequestType::OaisDeletion, &session(), &existing),
            Decision::Allow
        );
    }

    #[test]
    fn test_storage_deletion_vs_oais_deletion_is_one_way() {
        let oais_first = vec![live(1, RequestType::OaisDeletion, RequestState::Running, session())];
        assert_eq!(
            can_schedule(2, RequestType::StorageDeletion, &sip(3), &oais_first),
            Decision::Block
        );

        let storage_first = vec![live(1, RequestType::StorageDeletion, RequestState::Running, sip(3))];
        assert_eq!(
            can_schedule(2, RequestType::OaisDeletion, &session(), &storage_first),
            Decision::Allow
        );
    }

    #[test]
    fn test_sip_scope_overlaps_aips_of_that_sip_only() {
        assert!(sip(3).overlaps(&aip(30, 3)));
        assert!(!sip(3).overlaps(&aip(40, 4)));
        assert!(!sip(3).overlaps(&sip(4)));
    }

    #[test]
    fn test_error_requests_do_not_block() {
        let existing = vec![live(1, RequestType::AipStoreMetadata, RequestState::Error, aip(10, 1))];
        assert_eq!(
            can_schedule(2, RequestType::AipUpdate, &aip(10, 1), &existing),
            Decision::Allow
        );
    }

    #[test]
    fn test_full_conflict_table() {
        use RequestType::*;
        let expected: &[(RequestType, RequestType, bool)] = &[
            (AipUpdatesCreator, AipStoreMetadata, true),
            (AipUpdatesCreator, OaisDeletion, true),
            (AipUpdatesCreator, StorageDeletion, true),
            (AipUpdatesCreator, AipUpdatesCreator, true),
            (AipUpdatesCreator, AipUpdate, false),
            (AipUpdate, AipStoreMetadata, true),
            (AipUpdate, StorageDeletion, true),
            (AipUpdate, OaisDeletion, true),
            (AipUpdate, AipUpdate, false),
            (AipUpdate, AipUpdatesCreator, false),
            (AipStoreMetadata, AipUpdate, true),
            (AipStoreMetadata, AipUpdatesCreator, true),
            (AipStoreMetadata, StorageDeletion, true),
            (AipStoreMetadata, OaisDeletion, true),
            (OaisDeletion, AipStoreMetadata, true),
            (OaisDeletion, AipUpdate, true),
            (OaisDeletion, AipUpdatesCreator, true),
            (OaisDeletion, OaisDeletion, false),
            (OaisDeletion, StorageDeletion, false),
            (StorageDeletion, AipStoreMetadata, true),
            (StorageDeletion, AipUpdate, true),
            (StorageDeletion, AipUpdatesCreator, true),
            (StorageDeletion, OaisDeletion, true),
            (Ingest, OaisDeletion, false),
        ];
        for (candidate, existing, blocked) in expected {
            assert_eq!(
                blocking_types(*candidate).contains(existing),
                *blocked,
                "{} vs existing {}",
                candidate,
                existing
            );
        }
    }

    #[test]
    fn test_newer_blocked_request_yields_to_older() {
        // 1 RUNNING update, 2 BLOCKED store-metadata, 3 BLOCKED update
        let mut snapshot = vec![
            live(2, RequestType::AipStoreMetadata, RequestState::Blocked, aip(10, 1)),
            live(3, RequestType::AipUpdate, RequestState::Blocked, aip(10, 1)),
        ];

        let promoted = resolve_blocked(&[3, 2], &mut snapshot);

        assert_eq!(promoted, vec![2]);
        assert_eq!(snapshot[0].state, RequestState::Created);
        assert_eq!(snapshot[1].state, RequestState::Blocked);
    }

    #[test]
    fn test_newer_active_request_still_blocks_promotion() {
        // 1 BLOCKED storage deletion, 2 RUNNING oais deletion registered later
        let mut snapshot = vec![
            live(1, RequestType::StorageDeletion, RequestState::Blocked, sip(3)),
            live(2, RequestType::OaisDeletion, RequestState::Running, session()),
        ];

        assert!(resolve_blocked(&[1], &mut snapshot).is_empty());
    }
}
