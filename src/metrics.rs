use tracing::trace;

// Lightweight metrics helpers that are safe in demo builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "pawnshop.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "pawnshop.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn inc_escalations(reason: &str) {
    trace!(
        target = "pawnshop.metrics",
        reason = reason,
        "escalations_total_inc"
    );
}

pub fn inc_streams() {
    trace!(target = "pawnshop.metrics", "streams_opened_total_inc");
}
