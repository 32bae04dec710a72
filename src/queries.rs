/// Gmail search used as a coarse server-side prefilter.
///
/// Restricts the window to the last 30 days and mirrors the subject keywords
/// of the detector; the detector still decides candidacy.
pub const TRIAL_QUERY: &str = concat!(
    "newer_than:30d (trial OR \"free trial\" OR \"your trial\" OR essai OR \"essai gratuit\" ",
    "OR subscription OR abonnement OR billing OR invoice OR receipt OR renewal OR \"will be charged\")"
);

/// Upper bound accepted by the Gmail `messages.list` call
pub const MAX_RESULTS_LIMIT: u32 = 500;
