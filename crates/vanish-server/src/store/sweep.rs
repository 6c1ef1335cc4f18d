use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use redb::ReadableTable;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::db::{decode, Store, EXPIRY_INDEX, OWNER_INDEX, SECRETS, TOKENS};
use super::model::Lifetime;

/// Outcome of one sweep pass: deleted count per bucket, plus any bucket that failed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: BTreeMap<Lifetime, usize>,
    pub failed: Vec<Lifetime>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.removed.values().sum()
    }
}

impl Store {
    /// Delete every secret whose lifetime has elapsed as of now.
    pub fn sweep_expired(&self) -> SweepReport {
        self.sweep_expired_at(Self::now())
    }

    /// One pass over all buckets with `now` as the reference time.
    /// Each bucket commits on its own; a failed bucket is retried next pass.
    pub fn sweep_expired_at(&self, now: i64) -> SweepReport {
        let mut report = SweepReport::default();
        for lifetime in Lifetime::ALL {
            let cutoff = now - lifetime.seconds();
            match self.sweep_bucket(lifetime, cutoff) {
                Ok(removed) => {
                    if removed > 0 {
                        info!(bucket = %lifetime, removed, "swept expired secrets");
                    } else {
                        debug!(bucket = %lifetime, "nothing to sweep");
                    }
                    report.removed.insert(lifetime, removed);
                }
                Err(e) => {
                    warn!(bucket = %lifetime, error = %e, "sweep failed for bucket");
                    report.failed.push(lifetime);
                }
            }
        }
        report
    }

    /// Delete all secrets in `lifetime` with `created_at <= cutoff` in one transaction.
    fn sweep_bucket(&self, lifetime: Lifetime, cutoff: i64) -> Result<usize> {
        let code = lifetime.code();
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut expiry = write_txn.open_table(EXPIRY_INDEX)?;
            let due: Vec<(i64, u64)> = {
                let mut due = Vec::new();
                for item in expiry.range((code, i64::MIN, 0u64)..=(code, cutoff, u64::MAX))? {
                    let (k, _) = item?;
                    let (_, created_at, id) = k.value();
                    due.push((created_at, id));
                }
                due
            };

            if due.is_empty() {
                0
            } else {
                let mut secrets = write_txn.open_table(SECRETS)?;
                let mut tokens = write_txn.open_table(TOKENS)?;
                let mut owners = write_txn.open_table(OWNER_INDEX)?;
                for (created_at, id) in &due {
                    expiry.remove((code, *created_at, *id))?;
                    let raw_bytes: Option<Vec<u8>> =
                        secrets.remove(*id)?.map(|guard| guard.value().to_vec());
                    if let Some(bytes) = raw_bytes {
                        let record = decode(&bytes)?;
                        tokens.remove(record.passphrase_encrypted.as_slice())?;
                        owners.remove((record.owner_id, *id))?;
                    }
                }
                due.len()
            }
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Spawn a background Tokio task that calls `sweep_expired()` every `interval`.
    pub fn spawn_sweep(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let store = self.clone();
                match tokio::task::spawn_blocking(move || store.sweep_expired()).await {
                    Ok(report) => {
                        debug!(
                            removed = report.total(),
                            failed = report.failed.len(),
                            "background sweep finished"
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "background sweep task panicked");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;
    use crate::store::caller::Caller;
    use crate::store::db::tests::{
        count_secrets, make_store, put_ok, state_of, RetrievalState,
    };
    use crate::store::db::{PutResult, TakeResult};
    use crate::store::PageRequest;

    /// Store a secret that was created `age` seconds before now.
    fn put_aged(s: &Store, content: &[u8], lifetime: Lifetime, age: i64) -> Vec<u8> {
        let created_at = Store::now() - age;
        match s
            .put_at(1, content, None, lifetime, created_at, Caller::detached())
            .unwrap()
        {
            PutResult::Created { token, .. } => token,
            other => panic!("unexpected put result: {other:?}"),
        }
    }

    fn take(s: &Store, token: &[u8]) -> TakeResult {
        s.take(token, 1, Caller::detached()).unwrap()
    }

    #[test]
    fn five_minute_secret_is_gone_after_cutoff() {
        let (s, _dir) = make_store();
        let token = put_ok(&s, 1, "short", Lifetime::FiveMinutes);
        let created = Store::now();

        let early = s.sweep_expired_at(created + 60);
        assert_eq!(early.total(), 0);
        assert_eq!(state_of(&s, &token, created + 60), RetrievalState::Pending);

        let late = s.sweep_expired_at(created + 5 * 60 + 1);
        assert_eq!(late.removed[&Lifetime::FiveMinutes], 1);
        assert_eq!(take(&s, &token), TakeResult::NotFound);
        assert_eq!(s.list(1, PageRequest::default()).unwrap().total, 0);
    }

    #[test]
    fn buckets_use_their_own_cutoff() {
        let (s, _dir) = make_store();
        let now = Store::now();
        for lifetime in Lifetime::ALL {
            // One secret just past its cutoff, one just inside it.
            let cutoff = now - lifetime.seconds();
            s.put_at(1, b"old", None, lifetime, cutoff, Caller::detached())
                .unwrap();
            s.put_at(1, b"new", None, lifetime, cutoff + 1, Caller::detached())
                .unwrap();
        }

        let report = s.sweep_expired_at(now);
        assert!(report.failed.is_empty());
        for lifetime in Lifetime::ALL {
            assert_eq!(report.removed[&lifetime], 1, "bucket {lifetime}");
        }
        assert_eq!(count_secrets(&s), Lifetime::ALL.len());
    }

    #[test]
    fn sweep_is_idempotent() {
        let (s, _dir) = make_store();
        for _ in 0..3 {
            put_aged(&s, b"x", Lifetime::OneHour, 7200);
        }
        put_ok(&s, 1, "fresh", Lifetime::OneHour);

        let now = Store::now();
        assert_eq!(s.sweep_expired_at(now).total(), 3);
        assert_eq!(s.sweep_expired_at(now).total(), 0);
        assert_eq!(count_secrets(&s), 1);
    }

    #[test]
    fn retrieval_after_sweep_and_sweep_after_retrieval() {
        let (s, _dir) = make_store();
        let swept = put_aged(&s, b"a", Lifetime::FiveMinutes, 600);
        let taken = put_aged(&s, b"b", Lifetime::FiveMinutes, 600);

        // Retrieval does not check age; the record is still there until swept.
        assert_eq!(take(&s, &taken), TakeResult::Delivered(b"b".to_vec()));
        assert_eq!(s.sweep_expired_at(Store::now()).total(), 1);
        assert_eq!(take(&s, &swept), TakeResult::NotFound);
    }

    #[test]
    fn concurrent_take_and_sweep_remove_once() {
        for _ in 0..20 {
            let (s, _dir) = make_store();
            let token = put_aged(&s, b"contended", Lifetime::FiveMinutes, 600);
            let now = Store::now();
            let start = Arc::new(Barrier::new(2));

            let taker = {
                let (s, start) = (s.clone(), start.clone());
                std::thread::spawn(move || {
                    start.wait();
                    s.take(&token, 1, Caller::detached()).unwrap()
                })
            };
            let sweeper = {
                let (s, start) = (s.clone(), start.clone());
                std::thread::spawn(move || {
                    start.wait();
                    s.sweep_expired_at(now)
                })
            };

            let taken = taker.join().unwrap();
            let report = sweeper.join().unwrap();

            assert!(report.failed.is_empty());
            let swept = report.removed[&Lifetime::FiveMinutes];
            match taken {
                TakeResult::Delivered(content) => {
                    assert_eq!(content, b"contended");
                    assert_eq!(swept, 0);
                }
                TakeResult::NotFound => assert_eq!(swept, 1),
                other => panic!("unexpected take result: {other:?}"),
            }
            assert_eq!(count_secrets(&s), 0);
        }
    }

    #[tokio::test]
    async fn background_sweep_deletes_expired() {
        let (s, _dir) = make_store();
        put_aged(&s, b"stale", Lifetime::FiveMinutes, 3600);

        let handle = s.clone().spawn_sweep(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        assert_eq!(count_secrets(&s), 0);
    }
}
