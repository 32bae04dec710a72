//! Keyword scoring that decides whether a message looks like a trial or
//! subscription notice. Matching is case-insensitive substring matching.

pub const SUBJECT_KEYWORDS: &[&str] = &[
    "trial",
    "free trial",
    "your trial",
    "essai",
    "essai gratuit",
    "subscription",
    "abonnement",
    "invoice",
    "receipt",
    "billing",
    "renewal",
    "will be charged",
    "you'll be charged",
];

pub const BODY_KEYWORDS: &[&str] = &[
    "trial ends",
    "your trial ends",
    "ends on",
    "will be charged",
    "cancel anytime",
    "renewal",
    "billing",
    "subscription",
    "fin de l'essai",
    "vous serez facturé",
    "renouvellement",
];

pub const SENDER_HINTS: &[&str] = &["no-reply", "noreply", "billing", "receipt"];

/// Minimum score for a message to be considered a candidate
pub const CANDIDATE_THRESHOLD: u8 = 2;

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Score in 0..=4: subject match is worth 2, snippet and sender hints 1 each.
pub fn score(subject: &str, sender: &str, snippet: &str) -> u8 {
    let subject = subject.to_lowercase();
    let sender = sender.to_lowercase();
    let snippet = snippet.to_lowercase();

    let mut score = 0;

    if contains_any(&subject, SUBJECT_KEYWORDS) {
        score += 2;
    }

    if contains_any(&snippet, BODY_KEYWORDS) {
        score += 1;
    }

    if contains_any(&sender, SENDER_HINTS) {
        score += 1;
    }

    score
}

pub fn is_trial_candidate(subject: &str, sender: &str, snippet: &str) -> bool {
    score(subject, sender, snippet) >= CANDIDATE_THRESHOLD
}
