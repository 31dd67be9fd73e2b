//! Async driver for the election state machine.
//!
//! `LeaderElection` owns an [`Elector`], a [`BroadcastChannel`] and a
//! [`Timer`]. Its `run()` future pumps incoming election messages and timer
//! deadlines into the elector and must be spawned on a local executor for the
//! lifetime of the elector:
//!
//! ```ignore
//! let election = LeaderElection::new(channel, timer, ElectionConfig::default());
//! spawn_local({
//!     let election = election.clone();
//!     async move { election.run().await }
//! });
//! election
//!     .await_leadership(LeadershipHandlers::new().on_success(start_sync).on_cleanup(stop_sync))
//!     .await?;
//! ```

use super::config::ElectionConfig;
use super::elector::{ElectionEffect, Elector};
use super::messages::{ElectionMessage, ElectionToken};
use crate::channel::BroadcastChannel;
use crate::time::Timer;
use futures::channel::{mpsc, oneshot};
use futures::future::{self, Either, FutureExt};
use futures::{StreamExt, pin_mut, select_biased};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ElectionError {
    #[error("Elector is dead")]
    Dead,
}

pub type Result<T> = std::result::Result<T, ElectionError>;

/// Callbacks run when this elector gains and loses leadership.
#[derive(Default)]
pub struct LeadershipHandlers {
    success: Option<Box<dyn FnOnce()>>,
    cleanup: Option<Box<dyn FnOnce()>>,
}

impl LeadershipHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run once when leadership is acquired.
    pub fn on_success(mut self, f: impl FnOnce() + 'static) -> Self {
        self.success = Some(Box::new(f));
        self
    }

    /// Run once when leadership is lost (depose, coup or death).
    pub fn on_cleanup(mut self, f: impl FnOnce() + 'static) -> Self {
        self.cleanup = Some(Box::new(f));
        self
    }
}

struct Inner<C, T> {
    channel: C,
    timer: T,
    elector: RefCell<Elector>,
    handlers: RefCell<LeadershipHandlers>,
    leadership_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    leader_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    wake: mpsc::UnboundedSender<()>,
    queues: RefCell<Option<Queues>>,
}

struct Queues {
    inbox: mpsc::UnboundedReceiver<ElectionMessage>,
    wake: mpsc::UnboundedReceiver<()>,
}

/// One elector bound to one channel. Cheap to clone; clones share state.
pub struct LeaderElection<C, T> {
    inner: Rc<Inner<C, T>>,
}

impl<C, T> Clone for LeaderElection<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C: BroadcastChannel, T: Timer> LeaderElection<C, T> {
    /// Create an elector. Subscribes to the channel immediately so nothing
    /// posted before `run()` starts is missed.
    pub fn new(channel: C, timer: T, config: ElectionConfig) -> Self {
        let response_time = config
            .response_time
            .unwrap_or_else(|| channel.average_response_time());
        let elector = Elector::new(&config, response_time);
        let inbox = channel.subscribe_internal();
        let (wake_tx, wake_rx) = mpsc::unbounded();

        Self {
            inner: Rc::new(Inner {
                channel,
                timer,
                elector: RefCell::new(elector),
                handlers: RefCell::new(LeadershipHandlers::default()),
                leadership_waiters: RefCell::new(Vec::new()),
                leader_waiters: RefCell::new(Vec::new()),
                wake: wake_tx,
                queues: RefCell::new(Some(Queues {
                    inbox,
                    wake: wake_rx,
                })),
            }),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner.elector.borrow().is_leader()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.elector.borrow().is_dead()
    }

    /// True while some elector on the channel (possibly this one) is known to lead.
    pub fn leader_exists(&self) -> bool {
        self.inner.elector.borrow().leader_exists()
    }

    pub fn is_dictator(&self) -> bool {
        self.inner.elector.borrow().is_dictator()
    }

    pub fn token(&self) -> ElectionToken {
        self.inner.elector.borrow().token().clone()
    }

    pub fn channel(&self) -> &C {
        &self.inner.channel
    }

    /// Pump messages and timers into the elector until it dies or the
    /// channel closes. Only the first call does anything.
    pub async fn run(&self) {
        let Some(Queues {
            mut inbox,
            mut wake,
        }) = self.inner.queues.borrow_mut().take()
        else {
            warn!("Election driver already running");
            return;
        };
        debug!(token = %self.token(), "Election driver started");

        loop {
            if self.is_dead() {
                break;
            }

            let deadline = self.inner.elector.borrow().next_deadline();
            let sleep = match deadline {
                Some(at) => {
                    let wait = at.saturating_sub(self.inner.timer.now_ms());
                    Either::Left(self.inner.timer.sleep(Duration::from_millis(wait)))
                }
                None => Either::Right(future::pending::<()>()),
            }
            .fuse();
            pin_mut!(sleep);

            select_biased! {
                message = inbox.next() => match message {
                    Some(message) => {
                        let now = self.inner.timer.now_ms();
                        let effects = self.inner.elector.borrow_mut().handle_message(message, now);
                        self.apply(effects);
                    }
                    None => {
                        warn!("Election channel closed, stopping driver");
                        break;
                    }
                },
                _ = wake.next() => {}
                () = sleep => {
                    let now = self.inner.timer.now_ms();
                    let effects = self.inner.elector.borrow_mut().tick(now);
                    self.apply(effects);
                }
            }
        }

        debug!("Election driver stopped");
    }

    /// Compete for leadership. Resolves once this elector leads, after
    /// running `handlers.success`; `handlers.cleanup` runs when leadership is
    /// later lost. The most recently supplied handlers win.
    ///
    /// Fails only if the elector dies first.
    pub async fn await_leadership(&self, handlers: LeadershipHandlers) -> Result<()> {
        if self.is_dead() {
            return Err(ElectionError::Dead);
        }
        *self.inner.handlers.borrow_mut() = handlers;

        if self.is_leader() {
            self.apply(vec![ElectionEffect::BecameLeader]);
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.inner.leadership_waiters.borrow_mut().push(tx);

        let now = self.inner.timer.now_ms();
        let effects = self.inner.elector.borrow_mut().await_leadership(now);
        self.apply(effects);
        self.wake();

        rx.await.map_err(|_| ElectionError::Dead)
    }

    /// Resolves once any elector on the channel is confirmed leader.
    pub async fn wait_for_leader(&self) -> Result<()> {
        if self.is_dead() {
            return Err(ElectionError::Dead);
        }
        if self.leader_exists() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.inner.leader_waiters.borrow_mut().push(tx);
        rx.await.map_err(|_| ElectionError::Dead)
    }

    /// Give up leadership (or stop competing) and clear every pending timer.
    pub fn depose(&self) {
        let effects = self.inner.elector.borrow_mut().depose();
        self.apply(effects);
        self.wake();
    }

    /// Depose, announce DEATH and stop for good.
    ///
    /// Synchronous and idempotent, so it is safe to call from an unload handler.
    pub fn die(&self) {
        let effects = self.inner.elector.borrow_mut().die();
        if effects.is_empty() {
            return;
        }
        self.apply(effects);
        // Dropping the senders fails every pending waiter with `Dead`.
        drop(std::mem::take(&mut *self.inner.leadership_waiters.borrow_mut()));
        drop(std::mem::take(&mut *self.inner.leader_waiters.borrow_mut()));
        self.wake();
    }

    fn wake(&self) {
        let _ = self.inner.wake.unbounded_send(());
    }

    /// Carry out effects. No `RefCell` borrow is held while callbacks run,
    /// so they may call back into the election.
    fn apply(&self, effects: Vec<ElectionEffect>) {
        for effect in effects {
            match effect {
                ElectionEffect::Broadcast(message) => {
                    if let Err(e) = self.inner.channel.post_internal(message) {
                        // Indistinguishable from message loss; retries cover it.
                        warn!("Failed to post election message: {}", e);
                    }
                }
                ElectionEffect::BecameLeader => {
                    let success = self.inner.handlers.borrow_mut().success.take();
                    if let Some(success) = success {
                        success();
                    }
                    notify(&self.inner.leadership_waiters);
                }
                ElectionEffect::LeaderConfirmed => notify(&self.inner.leader_waiters),
                ElectionEffect::Deposed(reason) => {
                    info!(?reason, "Leadership lost");
                    let cleanup = self.inner.handlers.borrow_mut().cleanup.take();
                    if let Some(cleanup) = cleanup {
                        cleanup();
                    }
                }
            }
        }
    }
}

fn notify(waiters: &RefCell<Vec<oneshot::Sender<()>>>) {
    let waiters = std::mem::take(&mut *waiters.borrow_mut());
    for waiter in waiters {
        let _ = waiter.send(());
    }
}
