use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::drafter::{DraftError, DraftOutcome, ReplyDrafter};
use super::scheduler::{ShadowError, ShadowScheduler};
use super::types::{NewShadowReply, ReplyStatus, ShadowState};
use crate::clock::Clock;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub claimed: usize,
    pub drafted: usize,
    pub postponed: usize,
    pub parked: usize,
    pub failed: usize,
}

/// Drives due shadow states through the drafter, one claimed attempt at a
/// time.
pub struct ShadowReplyLoop {
    scheduler: Arc<ShadowScheduler>,
    drafter: Arc<dyn ReplyDrafter>,
    clock: Arc<dyn Clock>,
}

impl ShadowReplyLoop {
    pub fn new(scheduler: Arc<ShadowScheduler>, drafter: Arc<dyn ReplyDrafter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            scheduler,
            drafter,
            clock,
        }
    }

    pub fn run_once(&self) -> Result<TickReport, ShadowError> {
        let policy = *self.scheduler.policy();
        let now = self.clock.now();
        let due = self.scheduler.due(now, policy.batch_size)?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for state in due {
            if !self.scheduler.begin_attempt(state.conversation_id)? {
                debug!("shadow attempt already claimed conversation_id={}", state.conversation_id);
                continue;
            }
            report.claimed += 1;

            if let Err(err) = self.advance(&state, policy.typing_window_seconds, &mut report) {
                error!(
                    "shadow attempt aborted conversation_id={} err={}",
                    state.conversation_id, err
                );
                self.release(state.conversation_id);
                report.failed += 1;
            }
        }
        Ok(report)
    }

    fn advance(
        &self,
        state: &ShadowState,
        typing_window_seconds: u64,
        report: &mut TickReport,
    ) -> Result<(), ShadowError> {
        if self.still_typing(state, typing_window_seconds) {
            self.scheduler.postpone(state.conversation_id)?;
            report.postponed += 1;
            return Ok(());
        }
        self.attempt(state, report)
    }

    /// Hands a claimed attempt back after an error so it is retried with
    /// the postpone backoff. If that write fails too, the running lease
    /// brings the state back.
    fn release(&self, conversation_id: i64) {
        if let Err(err) = self.scheduler.postpone(conversation_id) {
            warn!(
                "shadow attempt left running until its lease expires conversation_id={} err={}",
                conversation_id, err
            );
        }
    }

    pub fn run(&self, stop_flag: &AtomicBool, idle: Duration) -> Result<(), ShadowError> {
        info!("shadow reply loop started");
        while !stop_flag.load(Ordering::Relaxed) {
            match self.run_once() {
                Ok(report) if report.claimed > 0 => {
                    info!(
                        "shadow tick due={} drafted={} postponed={} parked={} failed={}",
                        report.due, report.drafted, report.postponed, report.parked, report.failed
                    );
                    continue;
                }
                Ok(_) => {}
                Err(err) => error!("shadow tick failed: {}", err),
            }
            std::thread::sleep(idle);
        }
        info!("shadow reply loop stopped");
        Ok(())
    }

    fn still_typing(&self, state: &ShadowState, window_seconds: u64) -> bool {
        match state.last_inbound_timestamp_ms {
            Some(ts) => self.clock.now_ms().saturating_sub(ts) < (window_seconds as i64) * 1000,
            None => false,
        }
    }

    fn attempt(&self, state: &ShadowState, report: &mut TickReport) -> Result<(), ShadowError> {
        let conversation_id = state.conversation_id;
        let attempt_no = state.postpone_count + 1;
        let drafted = panic::catch_unwind(AssertUnwindSafe(|| self.drafter.draft(conversation_id, attempt_no)))
            .unwrap_or_else(|_| Err(DraftError::Fatal("drafter panicked".to_string())));
        match drafted {
            Ok(DraftOutcome::Reply(reply)) => {
                let recorded = NewShadowReply {
                    text: reply.text,
                    model: reply.model,
                    confidence: reply.confidence,
                    reason: reply.reason,
                    attempt_no,
                    status: ReplyStatus::Suggested,
                };
                let reply_id = self.scheduler.complete_attempt(conversation_id, Some(&recorded))?;
                info!(
                    "shadow reply suggested conversation_id={} reply_id={:?} attempt={}",
                    conversation_id, reply_id, attempt_no
                );
                report.drafted += 1;
            }
            Ok(DraftOutcome::NoReply { reason }) => {
                let recorded = NewShadowReply {
                    text: String::new(),
                    model: None,
                    confidence: None,
                    reason,
                    attempt_no,
                    status: ReplyStatus::NoReply,
                };
                self.scheduler.complete_attempt(conversation_id, Some(&recorded))?;
                report.drafted += 1;
            }
            Ok(DraftOutcome::NeedsLink) => {
                self.scheduler.park_needs_link(conversation_id)?;
                report.parked += 1;
            }
            Ok(DraftOutcome::Escalate { reason }) => {
                self.scheduler.escalate(conversation_id, &reason)?;
                report.parked += 1;
            }
            Err(DraftError::Transient(err)) => {
                warn!(
                    "shadow draft postponed conversation_id={} attempt={} err={}",
                    conversation_id, attempt_no, err
                );
                self.scheduler.postpone(conversation_id)?;
                report.postponed += 1;
            }
            Err(DraftError::Fatal(err)) => {
                error!(
                    "shadow draft failed conversation_id={} attempt={} err={}",
                    conversation_id, attempt_no, err
                );
                self.scheduler.fail_attempt(conversation_id, &err)?;
                report.failed += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::retry::ContentionPolicy;
    use crate::shadow::{DraftReply, ShadowPolicy, ShadowStatus};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use rusqlite::params;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedDrafter {
        outcomes: Mutex<Vec<Result<DraftOutcome, DraftError>>>,
        calls: Mutex<Vec<(i64, u32)>>,
    }

    impl ScriptedDrafter {
        fn new(mut outcomes: Vec<Result<DraftOutcome, DraftError>>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ReplyDrafter for ScriptedDrafter {
        fn draft(&self, conversation_id: i64, attempt_no: u32) -> Result<DraftOutcome, DraftError> {
            self.calls.lock().unwrap().push((conversation_id, attempt_no));
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(DraftOutcome::NoReply { reason: None }))
        }
    }

    struct Fixture {
        _temp: TempDir,
        clock: ManualClock,
        scheduler: Arc<ShadowScheduler>,
        conversation_id: i64,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path().join("runner.db")).unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap());
        let policy = ShadowPolicy {
            debounce_seconds: 5,
            typing_window_seconds: 20,
            postpone_ceiling: 2,
            ..ShadowPolicy::default()
        };
        let scheduler = Arc::new(ShadowScheduler::new(
            db.clone(),
            Arc::new(clock.clone()),
            policy,
            ContentionPolicy::default(),
        ));
        let conn = db.connection().unwrap();
        conn.execute(
            "INSERT INTO conversations (account_id, counterparty_id, created_at) VALUES ('acct', 'u1', ?1)",
            params!["2026-08-01T09:00:00.000Z"],
        )
        .unwrap();
        Fixture {
            _temp: temp,
            clock,
            scheduler,
            conversation_id: conn.last_insert_rowid(),
        }
    }

    fn runner(fx: &Fixture, drafter: Arc<ScriptedDrafter>) -> ShadowReplyLoop {
        ShadowReplyLoop::new(fx.scheduler.clone(), drafter, Arc::new(fx.clock.clone()))
    }

    #[test]
    fn waits_out_the_typing_window_before_drafting() {
        let fx = fixture();
        let drafter = Arc::new(ScriptedDrafter::new(vec![Ok(DraftOutcome::Reply(DraftReply {
            text: "Hi! Yes we do.".to_string(),
            model: None,
            confidence: Some(0.7),
            reason: None,
        }))]));
        let shadow = runner(&fx, drafter.clone());

        let inbound_ms = fx.clock.now_ms();
        fx.scheduler.touch(fx.conversation_id, Some(inbound_ms), 5).unwrap();
        fx.clock.advance(ChronoDuration::seconds(6));

        let first = shadow.run_once().unwrap();
        assert_eq!(first.postponed, 1);
        assert!(drafter.calls.lock().unwrap().is_empty());

        fx.clock.advance(ChronoDuration::seconds(180));
        let second = shadow.run_once().unwrap();
        assert_eq!(second.drafted, 1);
        assert_eq!(*drafter.calls.lock().unwrap(), vec![(fx.conversation_id, 2)]);

        let reply = fx.scheduler.latest_reply(fx.conversation_id).unwrap().unwrap();
        assert_eq!(reply.text, "Hi! Yes we do.");
        assert_eq!(reply.status, ReplyStatus::Suggested);
        let state = fx.scheduler.get(fx.conversation_id).unwrap().unwrap();
        assert_eq!(state.status, ShadowStatus::Pending);
        assert_eq!(state.next_attempt_at, None);
    }

    #[test]
    fn transient_failures_exhaust_at_the_ceiling() {
        let fx = fixture();
        let drafter = Arc::new(ScriptedDrafter::new(vec![
            Err(DraftError::Transient("timeout".to_string())),
            Err(DraftError::Transient("timeout".to_string())),
            Err(DraftError::Transient("timeout".to_string())),
        ]));
        let shadow = runner(&fx, drafter.clone());
        fx.scheduler.force_retry(fx.conversation_id).unwrap();

        assert_eq!(shadow.run_once().unwrap().postponed, 1);
        fx.clock.advance(ChronoDuration::seconds(181));
        assert_eq!(shadow.run_once().unwrap().postponed, 1);
        let state = fx.scheduler.get(fx.conversation_id).unwrap().unwrap();
        assert_eq!(state.status, ShadowStatus::Paused);
        assert_eq!(state.postpone_count, 2);

        fx.clock.advance(ChronoDuration::seconds(181));
        assert_eq!(shadow.run_once().unwrap().postponed, 1);
        assert_eq!(drafter.calls.lock().unwrap().len(), 3);

        let state = fx.scheduler.get(fx.conversation_id).unwrap().unwrap();
        assert_eq!(state.status, ShadowStatus::Exhausted);
        fx.clock.advance(ChronoDuration::hours(1));
        assert_eq!(shadow.run_once().unwrap().due, 0);
    }

    #[test]
    fn parking_and_fatal_outcomes() {
        let fx = fixture();
        let drafter = Arc::new(ScriptedDrafter::new(vec![
            Ok(DraftOutcome::NeedsLink),
            Err(DraftError::Fatal("bad request".to_string())),
        ]));
        let shadow = runner(&fx, drafter);

        fx.scheduler.force_retry(fx.conversation_id).unwrap();
        assert_eq!(shadow.run_once().unwrap().parked, 1);
        assert_eq!(
            fx.scheduler.get(fx.conversation_id).unwrap().unwrap().status,
            ShadowStatus::NeedsLink
        );

        fx.scheduler.clear_needs_link(fx.conversation_id).unwrap();
        assert_eq!(shadow.run_once().unwrap().failed, 1);
        let state = fx.scheduler.get(fx.conversation_id).unwrap().unwrap();
        assert_eq!(state.status, ShadowStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("bad request"));
    }

    struct PanickingDrafter;

    impl ReplyDrafter for PanickingDrafter {
        fn draft(&self, _conversation_id: i64, _attempt_no: u32) -> Result<DraftOutcome, DraftError> {
            panic!("drafter blew up");
        }
    }

    #[test]
    fn drafter_panic_does_not_leave_the_attempt_running() {
        let fx = fixture();
        let shadow = ShadowReplyLoop::new(fx.scheduler.clone(), Arc::new(PanickingDrafter), Arc::new(fx.clock.clone()));
        fx.scheduler.force_retry(fx.conversation_id).unwrap();

        let report = shadow.run_once().unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.failed, 1);
        let state = fx.scheduler.get(fx.conversation_id).unwrap().unwrap();
        assert_eq!(state.status, ShadowStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("drafter panicked"));

        // The next inbound message re-arms the conversation.
        assert_eq!(
            fx.scheduler.touch(fx.conversation_id, Some(fx.clock.now_ms()), 5).unwrap(),
            ShadowStatus::Pending
        );
    }

    #[test]
    fn abandoned_claim_is_picked_up_after_the_lease() {
        let fx = fixture();
        let drafter = Arc::new(ScriptedDrafter::new(vec![Ok(DraftOutcome::NoReply { reason: None })]));
        let shadow = runner(&fx, drafter.clone());
        fx.scheduler.force_retry(fx.conversation_id).unwrap();
        // Another process claimed the attempt and died.
        assert!(fx.scheduler.begin_attempt(fx.conversation_id).unwrap());

        assert_eq!(shadow.run_once().unwrap().due, 0);
        fx.clock.advance(ChronoDuration::seconds(901));
        assert_eq!(shadow.run_once().unwrap().drafted, 1);
        assert_eq!(drafter.calls.lock().unwrap().len(), 1);
        let state = fx.scheduler.get(fx.conversation_id).unwrap().unwrap();
        assert_eq!(state.status, ShadowStatus::Pending);
    }
}
