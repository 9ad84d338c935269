use super::store::{ChangeStore, CheckpointStore, SuggestionStore};
use super::{ChangeStatus, DetectedChange, SuggestionImpact, TrackedSuggestion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// # NDOC
/// component: `subsystems::change_tracking::progress`
/// purpose: The canonical, always-correct view of a page's change lifecycle, per spec.md §4.7.
///   Materialized onto the analysis row rather than derived on read, so a historical analysis's
///   `changes_summary.progress` stays meaningful even after later runs mutate change statuses.
/// invariants:
///   - Built purely from `detected_changes`/`tracked_suggestions` rows already committed to the
///     store; never reads an `Analysis.freeform_output`/`structured_output` field, so a model's
///     prose can drift from this summary but never corrupt it.
///   - Counts are exactly the lengths of the three item lists, never computed independently.
///   - `compose_or_fallback` fails closed: a store read error returns the caller's last-known
///     snapshot; if there is no prior snapshot either, it returns the "preserve watching" minimal
///     payload from spec.md §4.7 — `validated = 0`, `validatedItems = []`, `watchingItems`
///     untouched so the UI never has a change vanish outright.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedItem {
    pub change_id: String,
    pub element: String,
    pub correlation_unlocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchingItem {
    pub change_id: String,
    pub element: String,
    pub first_detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenItem {
    pub suggestion_id: String,
    pub title: String,
    pub element: String,
    pub impact: SuggestionImpact,
    pub times_suggested: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub validated: usize,
    pub watching: usize,
    pub open: usize,
    pub validated_items: Vec<ValidatedItem>,
    pub watching_items: Vec<WatchingItem>,
    pub open_items: Vec<OpenItem>,
}

fn impact_rank(impact: SuggestionImpact) -> u8 {
    match impact {
        SuggestionImpact::High => 0,
        SuggestionImpact::Medium => 1,
        SuggestionImpact::Low => 2,
    }
}

/// Pure projection: given a page's full change and open-suggestion sets, build the snapshot with
/// no I/O. Ordering follows spec.md §4.7 exactly:
///   - `validatedItems`: `status = validated`, newest `correlation_unlocked_at` first.
///   - `watchingItems`: `status = watching`, newest `first_detected_at` first.
///   - `openItems`: all open suggestions, highest impact first, then `times_suggested` descending.
pub fn compose(changes: &[DetectedChange], open_suggestions: &[TrackedSuggestion]) -> ProgressSnapshot {
    let mut validated_items: Vec<ValidatedItem> = changes
        .iter()
        .filter(|c| c.status == ChangeStatus::Validated)
        .map(|c| ValidatedItem {
            change_id: c.id.clone(),
            element: c.element.clone(),
            correlation_unlocked_at: c.correlation_unlocked_at.unwrap_or(c.first_detected_at),
        })
        .collect();
    validated_items.sort_by(|a, b| b.correlation_unlocked_at.cmp(&a.correlation_unlocked_at));

    let mut watching_items: Vec<WatchingItem> = changes
        .iter()
        .filter(|c| c.status == ChangeStatus::Watching)
        .map(|c| WatchingItem {
            change_id: c.id.clone(),
            element: c.element.clone(),
            first_detected_at: c.first_detected_at,
        })
        .collect();
    watching_items.sort_by(|a, b| b.first_detected_at.cmp(&a.first_detected_at));

    let mut open_items: Vec<OpenItem> = open_suggestions
        .iter()
        .map(|s| OpenItem {
            suggestion_id: s.id.clone(),
            title: s.title.clone(),
            element: s.element.clone(),
            impact: s.impact,
            times_suggested: s.times_suggested,
        })
        .collect();
    open_items.sort_by(|a, b| {
        impact_rank(a.impact)
            .cmp(&impact_rank(b.impact))
            .then(b.times_suggested.cmp(&a.times_suggested))
    });

    ProgressSnapshot {
        validated: validated_items.len(),
        watching: watching_items.len(),
        open: open_items.len(),
        validated_items,
        watching_items,
        open_items,
    }
}

/// Store-backed composition with the two-level fallback from spec.md §4.7/§7: a read failure
/// returns `previous` unchanged; if there is no `previous` either, the "preserve watching" minimal
/// payload is returned so a page's in-progress changes never read as having disappeared.
pub fn compose_or_fallback(
    changes: &dyn ChangeStore,
    suggestions: &dyn SuggestionStore,
    page_id: &str,
    previous: Option<&ProgressSnapshot>,
) -> ProgressSnapshot {
    let result = (|| -> crate::contracts::ToolResult<ProgressSnapshot> {
        let page_changes = changes.list_for_page(page_id)?;
        let open_suggestions = suggestions.list_open_for_page(page_id)?;
        Ok(compose(&page_changes, &open_suggestions))
    })();

    match result {
        Ok(snapshot) => snapshot,
        Err(_) => previous
            .cloned()
            .unwrap_or_else(|| preserve_watching_snapshot(&[])),
    }
}

/// The minimal payload spec.md §4.7 mandates on a double composer failure: zero validated changes
/// reported rather than a guess, but the caller's last-known `watchingItems` carried through so
/// they don't vanish from the UI.
pub fn preserve_watching_snapshot(watching_items: &[WatchingItem]) -> ProgressSnapshot {
    ProgressSnapshot {
        validated: 0,
        watching: watching_items.len(),
        open: 0,
        validated_items: Vec::new(),
        watching_items: watching_items.to_vec(),
        open_items: Vec::new(),
    }
}
