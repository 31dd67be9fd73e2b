//! Leader election across several electors sharing one in-memory channel.
//!
//! All tests run on a paused tokio clock inside a `LocalSet`, so response
//! windows and fallback intervals elapse instantly and deterministically.

mod common;

use common::{TokioTimer, init_tracing};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tabsync_core::election::DEFAULT_FALLBACK_INTERVAL;
use tabsync_core::{
    BroadcastChannel, BroadcastHub, ElectionConfig, ElectionError, InMemoryChannel,
    LeaderElection, LeadershipHandlers,
};
use tokio::task::{LocalSet, spawn_local};
use tokio::time::{sleep, timeout};

type Election = LeaderElection<InMemoryChannel, TokioTimer>;

const RESPONSE_TIME: Duration = Duration::from_millis(50);

/// Long enough for any uncontested election to finish.
const SETTLE: Duration = Duration::from_millis(500);

fn spawn_elector(hub: &BroadcastHub, config: ElectionConfig) -> Election {
    let channel = hub.connect().with_response_time(RESPONSE_TIME);
    let election = LeaderElection::new(channel, TokioTimer::new(), config);
    let driver = election.clone();
    spawn_local(async move { driver.run().await });
    election
}

/// Start competing in the background; the flag flips once leadership is won.
fn compete(election: &Election) -> Rc<Cell<bool>> {
    let won = Rc::new(Cell::new(false));
    let flag = Rc::clone(&won);
    let election = election.clone();
    spawn_local(async move {
        if election
            .await_leadership(LeadershipHandlers::new())
            .await
            .is_ok()
        {
            flag.set(true);
        }
    });
    won
}

fn leaders(electors: &[Election]) -> Vec<usize> {
    electors
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_leader())
        .map(|(i, _)| i)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_exactly_one_leader_among_many() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let electors: Vec<_> = (0..5)
                .map(|_| spawn_elector(&hub, ElectionConfig::default()))
                .collect();
            let won: Vec<_> = electors.iter().map(compete).collect();

            sleep(SETTLE).await;

            let leaders = leaders(&electors);
            assert_eq!(leaders.len(), 1, "expected one leader, got {leaders:?}");
            assert!(won[leaders[0]].get());
            assert_eq!(won.iter().filter(|w| w.get()).count(), 1);
            assert!(electors.iter().all(|e| e.leader_exists()));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_leader_stays_unique_across_fallback_retries() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let electors: Vec<_> = (0..3)
                .map(|_| spawn_elector(&hub, ElectionConfig::default()))
                .collect();
            electors.iter().for_each(|e| {
                compete(e);
            });

            sleep(SETTLE).await;
            let first = leaders(&electors);

            // Losers keep re-applying; the leader answers each round.
            sleep(DEFAULT_FALLBACK_INTERVAL * 3).await;
            assert_eq!(leaders(&electors), first);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_dictator_deposes_incumbent() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let incumbent = spawn_elector(&hub, ElectionConfig::default());
            let bystander = spawn_elector(&hub, ElectionConfig::default());

            let cleaned_up = Rc::new(Cell::new(false));
            {
                let incumbent = incumbent.clone();
                let flag = Rc::clone(&cleaned_up);
                spawn_local(async move {
                    let handlers = LeadershipHandlers::new().on_cleanup(move || flag.set(true));
                    let _ = incumbent.await_leadership(handlers).await;
                });
            }
            sleep(SETTLE).await;
            assert!(incumbent.is_leader());
            compete(&bystander);
            sleep(SETTLE).await;
            assert!(incumbent.is_leader());

            let dictator = spawn_elector(&hub, ElectionConfig::dictator());
            let won = compete(&dictator);
            sleep(SETTLE).await;

            assert!(dictator.is_leader());
            assert!(won.get());
            assert!(!incumbent.is_leader());
            assert!(!bystander.is_leader());
            assert!(cleaned_up.get());
            assert!(bystander.leader_exists());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_non_dictator_cannot_unseat_dictator() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let dictator = spawn_elector(&hub, ElectionConfig::dictator());
            compete(&dictator);
            sleep(SETTLE).await;
            assert!(dictator.is_leader());

            let challengers: Vec<_> = (0..3)
                .map(|_| spawn_elector(&hub, ElectionConfig::default()))
                .collect();
            challengers.iter().for_each(|e| {
                compete(e);
            });
            sleep(DEFAULT_FALLBACK_INTERVAL * 2).await;

            assert!(dictator.is_leader());
            assert!(leaders(&challengers).is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_reelection_after_leader_dies() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let electors: Vec<_> = (0..4)
                .map(|_| spawn_elector(&hub, ElectionConfig::default()))
                .collect();
            electors.iter().for_each(|e| {
                compete(e);
            });
            sleep(SETTLE).await;

            let old = leaders(&electors)[0];
            electors[old].die();
            assert!(electors[old].is_dead());

            sleep(DEFAULT_FALLBACK_INTERVAL + RESPONSE_TIME * 2).await;

            let survivors: Vec<_> = electors
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != old)
                .map(|(_, e)| e.clone())
                .collect();
            assert_eq!(leaders(&survivors).len(), 1);
            assert!(!electors[old].is_leader());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_reelection_when_death_message_is_lost() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let electors: Vec<_> = (0..3)
                .map(|_| spawn_elector(&hub, ElectionConfig::default()))
                .collect();
            electors.iter().for_each(|e| {
                compete(e);
            });
            sleep(SETTLE).await;

            let old = leaders(&electors)[0];
            electors[old].channel().set_muted(true);
            electors[old].die();

            // Survivors only notice through their fallback retry.
            sleep(DEFAULT_FALLBACK_INTERVAL + RESPONSE_TIME * 2).await;

            let new_leaders = leaders(&electors);
            assert_eq!(new_leaders.len(), 1);
            assert_ne!(new_leaders[0], old);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_leader_resolves_for_bystander() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let bystander = spawn_elector(&hub, ElectionConfig::default());
            let candidate = spawn_elector(&hub, ElectionConfig::default());
            assert!(!bystander.leader_exists());

            compete(&candidate);
            let result = timeout(SETTLE, bystander.wait_for_leader()).await;

            assert_eq!(result, Ok(Ok(())));
            assert!(bystander.leader_exists());
            assert!(!bystander.is_leader());
            assert!(candidate.is_leader());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_handlers_run_on_win_and_depose() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let election = spawn_elector(&hub, ElectionConfig::default());
            let started = Rc::new(Cell::new(0));
            let stopped = Rc::new(Cell::new(0));

            let handlers = {
                let started = Rc::clone(&started);
                let stopped = Rc::clone(&stopped);
                LeadershipHandlers::new()
                    .on_success(move || started.set(started.get() + 1))
                    .on_cleanup(move || stopped.set(stopped.get() + 1))
            };
            let result = timeout(SETTLE, election.await_leadership(handlers)).await;
            assert_eq!(result, Ok(Ok(())));
            assert_eq!((started.get(), stopped.get()), (1, 0));

            election.depose();
            assert!(!election.is_leader());
            assert!(!election.leader_exists());
            assert_eq!((started.get(), stopped.get()), (1, 1));

            // Deposed electors may compete again.
            let result = timeout(SETTLE, election.await_leadership(LeadershipHandlers::new())).await;
            assert_eq!(result, Ok(Ok(())));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_die_fails_pending_waiters_and_is_idempotent() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let hub = BroadcastHub::new();
            let election = spawn_elector(&hub, ElectionConfig::default());
            let observer = hub.connect();
            let mut inbox = observer.subscribe_internal();

            let pending = {
                let election = election.clone();
                spawn_local(async move { election.await_leadership(LeadershipHandlers::new()).await })
            };
            let waiting = {
                let election = election.clone();
                spawn_local(async move { election.wait_for_leader().await })
            };
            tokio::task::yield_now().await;

            election.die();
            election.die();

            assert_eq!(pending.await.unwrap(), Err(ElectionError::Dead));
            assert_eq!(waiting.await.unwrap(), Err(ElectionError::Dead));
            assert!(election.is_dead());
            assert_eq!(
                election.await_leadership(LeadershipHandlers::new()).await,
                Err(ElectionError::Dead)
            );

            // One APPLY, then exactly one DEATH.
            let mut deaths = 0;
            while let Ok(Some(message)) = inbox.try_next() {
                if message.action == tabsync_core::election::ElectionAction::Death {
                    deaths += 1;
                }
            }
            assert_eq!(deaths, 1);
        })
        .await;
}
