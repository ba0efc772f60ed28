//! Ranking properties that must hold for any feed.

use chrono::{DateTime, Duration, TimeZone, Utc};

use hubledger::hot_score::{compute_hot_score, rank, Boost, ContentItem};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 5, 20, 18, 15, 0).unwrap()
}

fn item(id: i64, age_hours: i64) -> ContentItem {
    ContentItem {
        id,
        score: 3,
        created_at: now() - Duration::hours(age_hours),
        vote_times: vec![now() - Duration::hours(1), now() - Duration::hours(2)],
        discussion_count: 2,
        boosts: Vec::new(),
        is_removed: false,
    }
}

#[test]
fn same_inputs_same_bits() {
    for age in [1, 30, 100, 5_000] {
        let it = item(1, age);
        let a = compute_hot_score(&it, now());
        let b = compute_hot_score(&it, now());
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn more_discussion_never_lowers_score() {
    let mut it = item(1, 10);
    let mut prev = compute_hot_score(&it, now());
    for count in [3, 5, 10, 100, 10_000] {
        it.discussion_count = count;
        let next = compute_hot_score(&it, now());
        assert!(next >= prev, "{} < {} at {}", next, prev, count);
        prev = next;
    }
}

#[test]
fn empty_item_is_finite() {
    let it = ContentItem {
        id: 9,
        score: 0,
        created_at: now(),
        vote_times: Vec::new(),
        discussion_count: 0,
        boosts: Vec::new(),
        is_removed: false,
    };
    assert!(compute_hot_score(&it, now()).is_finite());
}

#[test]
fn newer_items_rank_higher() {
    let items = vec![item(1, 400), item(2, 5), item(3, 60)];
    let ids: Vec<i64> = rank(&items, now()).into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![2, 3, 1]);
}

#[test]
fn paid_boost_lifts_item() {
    let plain = item(1, 20);
    let mut boosted = item(2, 20);
    boosted.boosts.push(Boost { amount: 500, paid: true, boost_time: 86_400 });
    let mut unpaid = item(3, 20);
    unpaid.boosts.push(Boost { amount: 500, paid: false, boost_time: 86_400 });

    assert!(compute_hot_score(&boosted, now()) > compute_hot_score(&plain, now()));
    assert_eq!(
        compute_hot_score(&unpaid, now()).to_bits(),
        compute_hot_score(&plain, now()).to_bits()
    );
}

#[test]
fn removed_items_are_dropped_and_ties_go_to_lower_id() {
    let mut removed = item(1, 5);
    removed.is_removed = true;
    let items = vec![removed, item(7, 30), item(4, 30)];
    let ranked = rank(&items, now());
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].0, 4);
    assert_eq!(ranked[1].0, 7);
}
