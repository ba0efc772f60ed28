//! Hot score ranking.
//!
//! The score is a sortable float built from five terms, each compressed by
//! [`piecewise_log`] so that a single viral item cannot dominate the feed:
//!
//! | Term        | Input                                                  |
//! |-------------|--------------------------------------------------------|
//! | base        | raw vote score                                         |
//! | upload date | creation time, anchored to a reference day two days ago |
//! | vote recency| average vote time since [`ALGO_START_UNIX`]            |
//! | votes       | vote count                                             |
//! | discussion  | discussion count                                       |
//! | boost       | sum of paid boosts                                     |
//!
//! The constants below are part of the ranking contract. Changing any of
//! them reorders every feed.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::logging::log_hot_score;

pub const ALGO_START_UNIX: f64 = 1_546_329_600.0;
pub const TIME_DIV: f64 = 3_600_000.0;
pub const DAY_SECONDS: f64 = 86_400.0;
pub const DATE_BOOST: f64 = 11.0;
pub const SCORE_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boost {
    pub amount: i64,
    pub paid: bool,
    /// Promotion length in seconds.
    pub boost_time: i64,
}

impl Boost {
    pub fn is_eligible(&self) -> bool {
        self.paid && self.amount > 0 && self.boost_time > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    /// Net vote score.
    pub score: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub vote_times: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub discussion_count: u64,
    #[serde(default)]
    pub boosts: Vec<Boost>,
    #[serde(default)]
    pub is_removed: bool,
}

/// Identity up to 1, logarithmic above; continuous and non-decreasing.
pub fn piecewise_log(x: f64) -> f64 {
    if x > 1.0 {
        1.0 + x.ln()
    } else {
        x
    }
}

/// Midnight UTC two days before `now`.
pub fn reference_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));
    today - Duration::days(2)
}

pub fn boost_amount(item: &ContentItem) -> i64 {
    item.boosts
        .iter()
        .filter(|b| b.is_eligible())
        .fold(0i64, |acc, b| acc.saturating_add(b.amount))
}

/// Raw score plus paid boosts, or `None` when the item is not promoted.
pub fn promoted_score(item: &ContentItem) -> Option<i64> {
    if item.boosts.iter().any(Boost::is_eligible) {
        Some(item.score.saturating_add(boost_amount(item)))
    } else {
        None
    }
}

fn secs(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

fn span_secs(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

fn upload_date_score(created_at: DateTime<Utc>, timeframe: DateTime<Utc>) -> f64 {
    if created_at > timeframe {
        // Recent uploads sit on the reference day at their own time of day,
        // then get a boost for how far past the reference day they landed.
        let time_of_day = NaiveTime::from_hms_opt(
            created_at.hour(),
            created_at.minute(),
            created_at.second(),
        )
        .unwrap_or(NaiveTime::MIN);
        let anchored = Utc.from_utc_datetime(&timeframe.date_naive().and_time(time_of_day));
        let delta_days = span_secs(created_at, timeframe) / DAY_SECONDS;
        secs(anchored) / TIME_DIV + piecewise_log(delta_days) * DATE_BOOST
    } else {
        let delta_days = span_secs(timeframe, created_at) / DAY_SECONDS;
        secs(created_at) / TIME_DIV - piecewise_log(delta_days + 1.0) * DATE_BOOST
    }
}

fn vote_recency_score(vote_times: &[DateTime<Utc>], timeframe: DateTime<Utc>) -> f64 {
    let avg_epoch = if vote_times.is_empty() {
        timeframe.timestamp() as f64
    } else {
        let total: f64 = vote_times.iter().map(|t| t.timestamp() as f64).sum();
        total / vote_times.len() as f64
    };
    (avg_epoch - ALGO_START_UNIX).max(0.0) / TIME_DIV
}

/// Pure and deterministic: identical inputs give bit-identical output.
pub fn compute_hot_score(item: &ContentItem, now: DateTime<Utc>) -> f64 {
    let timeframe = reference_day(now);

    let base_score = piecewise_log(item.score as f64 + 1.0);
    let uploaded_score = upload_date_score(item.created_at, timeframe);
    let vote_avg = vote_recency_score(&item.vote_times, timeframe);
    let vote_score = piecewise_log(item.vote_times.len() as f64 + 1.0);
    let discussion_score = piecewise_log(item.discussion_count as f64 + 1.0);

    let boost_sum = boost_amount(item);
    let boost_score = if boost_sum > 0 {
        piecewise_log(boost_sum as f64 + 1.0)
    } else {
        0.0
    };

    (base_score + uploaded_score + vote_avg + vote_score + discussion_score + boost_score)
        * SCORE_SCALE
}

/// Live items ordered hottest first; ties go to the lower id.
pub fn rank(items: &[ContentItem], now: DateTime<Utc>) -> Vec<(i64, f64)> {
    let mut scored: Vec<(i64, f64)> = items
        .iter()
        .filter(|item| !item.is_removed)
        .map(|item| {
            let score = compute_hot_score(item, now);
            log_hot_score(item.id, score);
            (item.id, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
}
