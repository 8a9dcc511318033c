// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Actor wrapper around [`ActivationController`].
//!
//! The controller runs on its own task and is driven through a cloneable
//! [`ControllerHandle`]. User commands, governor signals and dispatch results
//! are serialized through one `select!` loop, so a timer expiry and a user
//! action can never interleave inside a transition. Dispatch runs on a
//! separate task; while it is in flight the loop keeps answering commands
//! (a cancel gets `NotCancellable`, a snapshot shows `Executing`).

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::controller::{ActivationController, ActivationHandle, ControllerSnapshot, Transition};
use super::error::ProtocolError;
use crate::core::incident::{StepPayload, StepType};
use crate::dispatch::DispatchOutcome;

type Reply<T> = oneshot::Sender<Result<T, ProtocolError>>;

enum Command {
    Activate { reply: Reply<ActivationHandle> },
    Confirm {
        step: StepType,
        payload: Option<StepPayload>,
        reply: Reply<Transition>,
    },
    Cancel { reply: Reply<Transition> },
    Execute { reply: Reply<Transition> },
    Snapshot { reply: oneshot::Sender<ControllerSnapshot> },
}

/// Client side of a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ProtocolError::ControllerStopped)?;
        rx.await.map_err(|_| ProtocolError::ControllerStopped)
    }

    pub async fn activate(&self) -> Result<ActivationHandle, ProtocolError> {
        self.request(|reply| Command::Activate { reply }).await?
    }

    pub async fn confirm_step(&self, step: StepType, payload: Option<StepPayload>) -> Result<Transition, ProtocolError> {
        self.request(|reply| Command::Confirm { step, payload, reply }).await?
    }

    pub async fn cancel(&self) -> Result<Transition, ProtocolError> {
        self.request(|reply| Command::Cancel { reply }).await?
    }

    /// Resolves once the dispatcher has delivered, queued or given up.
    pub async fn execute_final(&self) -> Result<Transition, ProtocolError> {
        self.request(|reply| Command::Execute { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot, ProtocolError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

/// Move `controller` onto its own task.
///
/// The task ends once every handle is dropped and any in-flight dispatch has
/// resolved.
pub fn spawn_controller(controller: ActivationController) -> (ControllerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let task = tokio::spawn(run_controller(controller, rx));
    (ControllerHandle { tx }, task)
}

struct PendingExecution {
    started: Transition,
    reply: Reply<Transition>,
}

async fn run_controller(mut controller: ActivationController, mut commands: mpsc::Receiver<Command>) {
    let (done_tx, mut done_rx) = mpsc::channel::<DispatchOutcome>(1);
    let mut pending: Option<PendingExecution> = None;
    let mut open = true;

    loop {
        tokio::select! {
            biased;

            Some(signal) = controller.next_signal() => {
                controller.handle_signal(signal);
            }
            Some(outcome) = done_rx.recv() => {
                let result = controller.finish_execution(outcome);
                if let Some(PendingExecution { started, reply }) = pending.take() {
                    let result = result.map(|mut finished| {
                        let mut warnings = started.warnings;
                        warnings.append(&mut finished.warnings);
                        finished.from = started.from;
                        finished.warnings = warnings;
                        finished
                    });
                    let _ = reply.send(result);
                }
                if !open {
                    break;
                }
            }
            cmd = commands.recv(), if open => match cmd {
                Some(cmd) => {
                    if let Some(execution) = handle_command(&mut controller, cmd, &done_tx).await {
                        pending = Some(execution);
                    }
                }
                None => {
                    open = false;
                    if pending.is_none() {
                        break;
                    }
                    tracing::info!("protocol: handles dropped, waiting for dispatch to resolve");
                }
            },
        }
    }

    controller.dispose();
}

/// Apply one command. An accepted execute hands the incident to the
/// dispatcher on a separate task and returns the reply to complete later.
async fn handle_command(
    controller: &mut ActivationController,
    cmd: Command,
    done: &mpsc::Sender<DispatchOutcome>,
) -> Option<PendingExecution> {
    match cmd {
        Command::Activate { reply } => {
            let _ = reply.send(controller.activate());
        }
        Command::Confirm { step, payload, reply } => {
            let _ = reply.send(controller.confirm_step(step, payload).await);
        }
        Command::Cancel { reply } => {
            let _ = reply.send(controller.cancel());
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(controller.snapshot());
        }
        Command::Execute { reply } => match controller.begin_execution() {
            Ok(started) => {
                let dispatcher = controller.dispatcher();
                let done = done.clone();
                let id = started.incident_id.clone();
                tokio::spawn(async move {
                    let outcome = dispatcher.dispatch(&id).await;
                    let _ = done.send(outcome).await;
                });
                return Some(PendingExecution { started, reply });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        },
    }
    None
}
