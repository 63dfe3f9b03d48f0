//! Peer ranking by course overlap.

use crate::common::course::CourseCode;
use crate::common::models::{RankedPeer, User};
use crate::server::database::Database;
use crate::server::error::ServiceResult;
use crate::server::users;
use log::info;
use std::collections::HashSet;

/// Normalize raw course labels into the set used for scoring. Blank labels
/// are dropped, duplicates collapse.
pub fn search_set(desired_courses: &[String]) -> HashSet<CourseCode> {
    desired_courses
        .iter()
        .map(|raw| CourseCode::parse(raw))
        .filter(|code| !code.is_empty())
        .collect()
}

/// Score one candidate against the search set. The score is the size of the
/// intersection of two sets, so a course repeated on either side counts once.
pub fn score_peer(peer: User, search: &HashSet<CourseCode>) -> RankedPeer {
    let mut seen = HashSet::new();
    let matched_courses: Vec<CourseCode> = peer
        .courses_seeking
        .iter()
        .map(|raw| CourseCode::parse(raw.as_str()))
        .filter(|code| search.contains(code) && seen.insert(code.clone()))
        .collect();
    let total_courses = peer.courses_seeking.len();
    RankedPeer {
        match_score: matched_courses.len(),
        matched_courses,
        total_courses,
        user: peer,
    }
}

/// Descending score, then descending total course count. The sort is stable,
/// so exact ties keep their retrieval order.
pub fn sort_ranked(peers: &mut [RankedPeer]) {
    peers.sort_by(|a, b| {
        b.match_score
            .cmp(&a.match_score)
            .then_with(|| b.total_courses.cmp(&a.total_courses))
    });
}

pub async fn rank_peers(db: &Database, requester_id: &str, desired_courses: &[String]) -> ServiceResult<Vec<RankedPeer>> {
    let search = search_set(desired_courses);
    if search.is_empty() {
        return Ok(Vec::new());
    }

    let mut codes: Vec<CourseCode> = search.iter().cloned().collect();
    codes.sort();
    let candidates = users::find_by_course_membership(db, &codes, requester_id).await?;

    let mut ranked: Vec<RankedPeer> = candidates
        .into_iter()
        .map(|peer| score_peer(peer, &search))
        .filter(|peer| peer.match_score > 0)
        .collect();
    sort_ranked(&mut ranked);

    info!(
        "[MATCH] Ranked {} peers for user {} over {} course(s)",
        ranked.len(),
        requester_id,
        search.len()
    );
    Ok(ranked)
}
