// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Safety governor: the per-step countdown and the session ceiling.
//!
//! Each timer is a spawned task that sleeps and then sends a
//! [`GovernorSignal`] tagged with the epoch or session it was armed for. Timers
//! never touch protocol state themselves; the controller feeds the signal to
//! the state machine, which discards it if the tag is stale.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A timer expiry, delivered to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorSignal {
    StepTimeout { epoch: u64 },
    SessionExpired { session: u64 },
}

pub struct SafetyGovernor {
    step_timeout: Duration,
    session_ceiling: Duration,
    tx: mpsc::Sender<GovernorSignal>,
    step_task: Option<JoinHandle<()>>,
    session_task: Option<JoinHandle<()>>,
}

impl SafetyGovernor {
    /// Create a governor and the receiver its signals arrive on.
    pub fn new(step_timeout: Duration, session_ceiling: Duration) -> (Self, mpsc::Receiver<GovernorSignal>) {
        let (tx, rx) = mpsc::channel(16);
        let governor = Self {
            step_timeout,
            session_ceiling,
            tx,
            step_task: None,
            session_task: None,
        };
        (governor, rx)
    }

    fn spawn_timer(&self, after: Duration, signal: GovernorSignal) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(signal).await;
        })
    }

    /// (Re)start the step countdown. Any previous countdown is aborted.
    pub fn arm_step(&mut self, epoch: u64) {
        self.disarm_step();
        tracing::debug!("governor: step timer armed (epoch {}, {:?})", epoch, self.step_timeout);
        self.step_task = Some(self.spawn_timer(self.step_timeout, GovernorSignal::StepTimeout { epoch }));
    }

    pub fn disarm_step(&mut self) {
        if let Some(task) = self.step_task.take() {
            task.abort();
        }
    }

    /// Start the session ceiling for a new activation.
    pub fn start_session(&mut self, session: u64) {
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
        tracing::debug!("governor: session ceiling started (session {}, {:?})", session, self.session_ceiling);
        self.session_task = Some(self.spawn_timer(
            self.session_ceiling,
            GovernorSignal::SessionExpired { session },
        ));
    }

    /// Abort both timers.
    pub fn stop_all(&mut self) {
        self.disarm_step();
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
    }

    pub fn step_armed(&self) -> bool {
        self.step_task.as_ref().map_or(false, |t| !t.is_finished())
    }

    pub fn session_running(&self) -> bool {
        self.session_task.as_ref().map_or(false, |t| !t.is_finished())
    }
}

impl Drop for SafetyGovernor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
