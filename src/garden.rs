use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{InvestOutcome, InvestTarget, Preference};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

pub const INVEST_COST: u32 = 10;
const TAP_REWARDS: [u32; 3] = [30, 40, 50];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TapOutcome {
    Rewarded { amount: u32, balance: u32 },
    NoReward { next_at: DateTime<Utc> },
}

/// Investment needed to finish `level`.
pub fn level_cost(level: u32) -> u32 {
    level.saturating_mul(100)
}

pub fn worker_count(level: u32) -> u32 {
    match level {
        0..=4 => 1,
        5..=14 => 2,
        15..=29 => 3,
        30..=49 => 4,
        _ => 5,
    }
}

pub fn worker_efficiency(level: u32) -> f64 {
    1.0 + f64::from(level) * 0.01
}

/// Applies one investment to `pref` in place.
pub fn apply_investment(pref: &mut Preference, target: InvestTarget) -> InvestOutcome {
    let is_super_user = pref.is_super_user;
    let (level, investment) = match target {
        InvestTarget::Tree => (&mut pref.tree_level, &mut pref.tree_investment),
        InvestTarget::Worker => (&mut pref.worker_level, &mut pref.worker_investment),
    };

    if is_super_user {
        *level += 1;
        *investment = 0;
        return InvestOutcome::LeveledUp { level: *level };
    }

    if pref.life_water < INVEST_COST {
        return InvestOutcome::InsufficientWater {
            balance: pref.life_water,
        };
    }
    pref.life_water -= INVEST_COST;
    *investment += INVEST_COST;

    let cost = level_cost(*level);
    if *investment >= cost {
        *level += 1;
        *investment = 0;
        InvestOutcome::LeveledUp { level: *level }
    } else {
        InvestOutcome::Invested {
            investment: *investment,
            cost,
        }
    }
}

#[derive(Clone)]
pub struct Garden {
    db: Arc<Database>,
}

impl Garden {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn invest(&self, target: InvestTarget) -> AppResult<InvestOutcome> {
        let (pref, outcome) = self
            .db
            .modify_preference(|pref| Ok(apply_investment(pref, target)))?;
        tracing::info!(?target, ?outcome, balance = pref.life_water, "garden investment");
        Ok(outcome)
    }

    /// Hourly reward for tapping the tree; super users are never rate limited.
    pub fn tap_tree(&self, now: DateTime<Utc>) -> AppResult<TapOutcome> {
        let (_, outcome) = self.db.modify_preference(|pref| {
            if !pref.is_super_user {
                if let Some(last) = pref.last_win_at {
                    let next_at = last + Duration::hours(1);
                    if now < next_at {
                        return Ok(TapOutcome::NoReward { next_at });
                    }
                }
            }

            let amount = TAP_REWARDS[rand::random_range(0..TAP_REWARDS.len())];
            pref.life_water = pref.life_water.saturating_add(amount);
            pref.last_win_at = Some(now);
            Ok(TapOutcome::Rewarded {
                amount,
                balance: pref.life_water,
            })
        })?;
        if let TapOutcome::Rewarded { amount, balance } = outcome {
            tracing::info!(amount, balance, "tree reward");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_investment, level_cost, worker_count, worker_efficiency, Garden, TapOutcome};
    use crate::db::Database;
    use crate::models::{InvestOutcome, InvestTarget, Preference};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    #[test]
    fn worker_count_steps_up_by_level_band() {
        let counts: Vec<u32> = [1, 4, 5, 14, 15, 29, 30, 49, 50, 100].iter().map(|level| worker_count(*level)).collect();
        assert_eq!(counts, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5]);
        assert!((worker_efficiency(10) - 1.1).abs() < f64::EPSILON);
    }

    #[test]
    fn investment_levels_up_once_cost_is_reached() {
        let mut pref = Preference {
            life_water: 100,
            tree_investment: 90,
            ..Preference::default()
        };
        assert_eq!(level_cost(pref.tree_level), 100);

        let outcome = apply_investment(&mut pref, InvestTarget::Tree);
        assert_eq!(outcome, InvestOutcome::LeveledUp { level: 2 });
        assert_eq!(pref.tree_investment, 0);
        assert_eq!(pref.life_water, 90);

        let outcome = apply_investment(&mut pref, InvestTarget::Tree);
        assert_eq!(outcome, InvestOutcome::Invested { investment: 10, cost: 200 });
    }

    #[test]
    fn investment_refused_without_water_unless_super_user() {
        let mut pref = Preference {
            life_water: 5,
            ..Preference::default()
        };
        assert_eq!(
            apply_investment(&mut pref, InvestTarget::Worker),
            InvestOutcome::InsufficientWater { balance: 5 }
        );
        assert_eq!(pref.worker_investment, 0);

        pref.is_super_user = true;
        assert_eq!(
            apply_investment(&mut pref, InvestTarget::Worker),
            InvestOutcome::LeveledUp { level: 2 }
        );
        assert_eq!(pref.life_water, 5);
    }

    #[test]
    fn tree_reward_is_hourly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("garden.db")).expect("db"));
        let garden = Garden::new(db.clone());
        let now = Utc::now();

        let TapOutcome::Rewarded { amount, balance } = garden.tap_tree(now).expect("tap") else {
            panic!("first tap should be rewarded");
        };
        assert!([30, 40, 50].contains(&amount));
        assert_eq!(balance, amount);

        let second = garden.tap_tree(now + Duration::minutes(30)).expect("tap");
        assert_eq!(second, TapOutcome::NoReward { next_at: now + Duration::hours(1) });

        let third = garden.tap_tree(now + Duration::minutes(61)).expect("tap");
        assert!(matches!(third, TapOutcome::Rewarded { .. }));
        let pref = db.get_preference().expect("pref").expect("present");
        assert_eq!(pref.last_win_at, Some(now + Duration::minutes(61)));
    }
}
