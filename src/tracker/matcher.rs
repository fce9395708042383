use super::orb::Descriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorMatch {
    /// Index into the query (template) descriptors.
    pub query: usize,
    /// Index into the train (next frame) descriptors.
    pub train: usize,
    pub distance: u32,
}

fn nearest(from: &Descriptor, candidates: &[Descriptor]) -> Option<(usize, u32)> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, from.distance(c)))
        .min_by_key(|&(i, d)| (d, i))
}

/// Brute-force Hamming matching keeping only mutual nearest neighbours,
/// best distance first.
pub fn cross_check_match(query: &[Descriptor], train: &[Descriptor]) -> Vec<DescriptorMatch> {
    if query.is_empty() || train.is_empty() {
        return Vec::new();
    }
    let backward: Vec<usize> = train
        .iter()
        .filter_map(|t| nearest(t, query).map(|(i, _)| i))
        .collect();

    let mut matches: Vec<DescriptorMatch> = query
        .iter()
        .enumerate()
        .filter_map(|(qi, q)| {
            let (ti, distance) = nearest(q, train)?;
            (backward[ti] == qi).then_some(DescriptorMatch {
                query: qi,
                train: ti,
                distance,
            })
        })
        .collect();
    matches.sort_by_key(|m| m.distance);
    matches
}
