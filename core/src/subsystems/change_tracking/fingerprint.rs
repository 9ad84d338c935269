use super::{ChangeScope, ChangeStatus, DetectedChange};

/// # NDOC
/// component: `subsystems::change_tracking::fingerprint`
/// purpose: Validate an LLM-proposed `matched_change_id` against the exact candidate set that
///   was sent to the model, per the trust boundary in spec.md §9 ("LLM matched_change_id trust
///   boundary") and §4.2.
/// invariants:
///   - The proposed id must exist in `candidates` (the set actually offered to the LLM, not
///     the full table) — an id the LLM invents or recalls from a different page is rejected.
///   - The candidate's `scope` must equal the LLM's reported scope.
///   - Any other proposal degrades silently to a fresh insert; the caller never panics or
///     bubbles this up as an error (spec.md §7, "authorization drift").
pub fn validate_matched_change<'a>(
    candidates: &'a [DetectedChange],
    proposed_id: &str,
    proposed_scope: ChangeScope,
) -> Option<&'a DetectedChange> {
    candidates
        .iter()
        .find(|c| c.id == proposed_id && c.scope == proposed_scope)
}

/// # NDOC
/// component: `subsystems::change_tracking::fingerprint`
/// purpose: Validate an LLM-proposed reverted change id per spec.md §4.2 "Revert detection".
/// invariants:
///   - Must be a member of the candidate ids actually sent to the LLM.
///   - Must still be `status = watching` in the store (state may have moved since the prompt
///     was built).
///   - Must be owned by the requesting user.
pub fn validate_revert_candidate<'a>(
    candidates: &'a [DetectedChange],
    proposed_id: &str,
    requesting_user_id: &str,
) -> Option<&'a DetectedChange> {
    candidates.iter().find(|c| {
        c.id == proposed_id && c.status == ChangeStatus::Watching && c.user_id == requesting_user_id
    })
}
