/// Rank candidate context ids for a typo'd id: Levenshtein distance
/// ascending, with a one-point boost for substring affinity (the candidate
/// contains the target, the target contains the candidate, or the candidate
/// contains most of the target's prefix), case-insensitively. Ties break
/// alphabetically.
pub fn suggest(target: &str, candidates: &[String], k: usize) -> Vec<String> {
    let target_lower = target.to_lowercase();

    let mut scored: Vec<(usize, &String)> = candidates
        .iter()
        .map(|candidate| {
            let candidate_lower = candidate.to_lowercase();
            let mut score = strsim::levenshtein(&target_lower, &candidate_lower);
            if substring_affinity(&target_lower, &candidate_lower) {
                score = score.saturating_sub(1);
            }
            (score, candidate)
        })
        .collect();

    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored
        .into_iter()
        .take(k)
        .map(|(_, candidate)| candidate.clone())
        .collect()
}

fn substring_affinity(target: &str, candidate: &str) -> bool {
    if candidate.contains(target) || target.contains(candidate) {
        return true;
    }
    // longest target prefix appearing in the candidate covers most of it
    let mut len = target.len();
    while len > 0 && !(target.is_char_boundary(len) && candidate.contains(&target[..len])) {
        len -= 1;
    }
    len * 2 >= target.len()
}
