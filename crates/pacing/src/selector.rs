use chrono::{DateTime, Utc};

use common::{Account, AccountStatus};

/// The composite eligibility chain, in order, short-circuiting on the
/// first failure. Panic flags and per-workload quotas are checked by the
/// caller before the pool reaches this point.
pub fn is_eligible(account: &Account, now: DateTime<Utc>) -> bool {
    if account.status != AccountStatus::Active {
        // A flood-waited account whose deadline passed is reactivated by
        // the store sweep before selection; anything still not active
        // here stays out.
        return false;
    }
    if let Some(until) = account.flood_wait_until {
        if until > now {
            return false;
        }
    }
    account.daily_remaining() > 0
}

fn score(account: &Account) -> f64 {
    account.daily_remaining() as f64 * account.reliability_score / 100.0
        - account.consecutive_errors as f64 * 10.0
}

/// Pick the best eligible account from the candidate set, or None.
/// Highest score wins; ties break toward the lowest daily_sent, then
/// the earliest-created account.
pub fn select_account<'a>(pool: &'a [Account], now: DateTime<Utc>) -> Option<&'a Account> {
    pool.iter()
        .filter(|a| is_eligible(a, now))
        .max_by(|a, b| {
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                // max_by keeps the later element on ties, so invert the
                // tie-breaks: prefer lower daily_sent, earlier creation.
                .then_with(|| b.daily_sent.cmp(&a.daily_sent))
                .then_with(|| b.created_at.cmp(&a.created_at))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AccountRole, WarmupStatus};

    fn account(id: i64, daily_sent: i64, reliability: f64, errors: i64) -> Account {
        Account {
            id,
            tenant: 1,
            phone: format!("+7900000000{id}"),
            status: AccountStatus::Active,
            daily_sent,
            daily_limit: 30,
            daily_errors: 0,
            reliability_score: reliability,
            consecutive_errors: errors,
            flood_wait_until: None,
            warmup_status: WarmupStatus::None,
            role: AccountRole::Observer,
            folder: None,
            proxy: None,
            telegram_id: None,
            username: None,
            first_name: None,
            created_at: Utc::now() + chrono::Duration::seconds(id),
        }
    }

    #[test]
    fn exhausted_and_inactive_accounts_are_skipped() {
        let now = Utc::now();
        let mut spent = account(1, 30, 100.0, 0);
        let mut blocked = account(2, 0, 100.0, 0);
        blocked.status = AccountStatus::Blocked;
        let ok = account(3, 0, 50.0, 0);

        assert!(!is_eligible(&spent, now));
        assert!(!is_eligible(&blocked, now));
        assert!(is_eligible(&ok, now));

        spent.daily_sent = 29;
        assert!(is_eligible(&spent, now));
        let accounts = [spent.clone(), blocked, ok.clone()];
        let picked = select_account(&accounts, now).unwrap();
        // 1 remaining × 1.0 < 30 remaining × 0.5
        assert_eq!(picked.id, ok.id);
    }

    #[test]
    fn future_flood_wait_excludes_elapsed_does_not() {
        let now = Utc::now();
        let mut waiting = account(1, 0, 100.0, 0);
        waiting.flood_wait_until = Some(now + chrono::Duration::seconds(30));
        assert!(!is_eligible(&waiting, now));

        waiting.flood_wait_until = Some(now - chrono::Duration::seconds(30));
        assert!(is_eligible(&waiting, now));
    }

    #[test]
    fn consecutive_errors_penalize_score() {
        let now = Utc::now();
        let reliable = account(1, 10, 100.0, 0); // 20 × 1.0 = 20
        let flaky = account(2, 0, 100.0, 2); // 30 × 1.0 − 20 = 10
        let accounts = [reliable.clone(), flaky];
        let picked = select_account(&accounts, now).unwrap();
        assert_eq!(picked.id, reliable.id);
    }

    #[test]
    fn ties_break_by_daily_sent_then_age() {
        let now = Utc::now();
        // Same score by construction: equal remaining, reliability, errors.
        let older = account(1, 5, 80.0, 0);
        let newer = account(2, 5, 80.0, 0);
        let accounts = [newer.clone(), older.clone()];
        let picked = select_account(&accounts, now).unwrap();
        assert_eq!(picked.id, older.id, "earlier-created wins the tie");

        let busy = account(3, 6, 80.0, 0);
        let mut idle = account(4, 5, 80.0, 0);
        // Align scores: busy has 24 remaining, idle 25 — give idle a
        // slightly lower reliability so scores match (24×0.8 = 25×0.768).
        idle.reliability_score = 76.8;
        let accounts = [busy, idle.clone()];
        let picked = select_account(&accounts, now).unwrap();
        assert_eq!(picked.id, idle.id, "lower daily_sent wins the tie");
    }

    #[test]
    fn empty_or_fully_ineligible_pool_returns_none() {
        let now = Utc::now();
        assert!(select_account(&[], now).is_none());
        let spent = account(1, 30, 100.0, 0);
        assert!(select_account(&[spent], now).is_none());
    }
}
